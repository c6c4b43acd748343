//! HTTP Surface
//!
//! Read-only endpoints over the ledger. The tenant for `/audit-events`
//! comes from the `x-tenant-id` header, which the upstream access-control
//! layer sets after authenticating the caller.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, MethodRouter},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::coverage::RouteSpec;
use crate::error::LedgerError;
use crate::ledger::{AuditPage, AuditQuery, Ledger, TenantKey};
use crate::store::LedgerStore;

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Clone)]
pub struct AppState<S> {
    pub ledger: Ledger<S>,
    pub backend: &'static str,
}

/// Every endpoint with its coverage description. The router and the
/// coverage check are both built from this table.
fn route_table<S: LedgerStore>() -> Vec<(RouteSpec, MethodRouter<AppState<S>>)> {
    vec![
        (RouteSpec::new("GET", "/health", &[]), get(health_check)),
        (RouteSpec::new("GET", "/status", &[]), get(status_endpoint::<S>)),
        (
            RouteSpec::new("GET", "/audit-events", &[]),
            get(list_audit_events::<S>),
        ),
    ]
}

pub fn router<S: LedgerStore>(state: AppState<S>) -> Router {
    let mut router = Router::new();
    for (spec, handler) in route_table::<S>() {
        router = router.route(&spec.path, handler);
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

/// The route table, for coverage checks.
pub fn routes<S: LedgerStore>() -> Vec<RouteSpec> {
    route_table::<S>().into_iter().map(|(spec, _)| spec).collect()
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::UnknownPartition(_) => StatusCode::NOT_FOUND,
            LedgerError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            LedgerError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "audit-ledger",
        "timestamp": chrono::Utc::now()
    }))
}

async fn status_endpoint<S: LedgerStore>(
    State(state): State<AppState<S>>,
) -> Result<Json<Value>, ApiError> {
    let partitions = state.ledger.store().partition_keys().await?;
    Ok(Json(json!({
        "status": "healthy",
        "service": "audit-ledger",
        "timestamp": chrono::Utc::now(),
        "backend": state.backend,
        "partitions": partitions.len(),
    })))
}

async fn list_audit_events<S: LedgerStore>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditPage>, ApiError> {
    let Some(raw) = headers.get(TENANT_HEADER) else {
        warn!("audit query without tenant header");
        return Err(ApiError::bad_request(format!("{} header is required", TENANT_HEADER)));
    };
    let raw = raw
        .to_str()
        .map_err(|_| ApiError::bad_request(format!("{} header is not valid text", TENANT_HEADER)))?;
    if raw.trim().is_empty() {
        return Err(ApiError::bad_request(format!("{} header is empty", TENANT_HEADER)));
    }

    let tenant: TenantKey = raw.parse()?;
    let page = state.ledger.query(&tenant, &query).await?;
    Ok(Json(page))
}
