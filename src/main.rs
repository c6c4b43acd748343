use std::net::SocketAddr;
use tracing::info;

use audit_ledger::config::AppConfig;
use audit_ledger::logging::init_tracing;
use audit_ledger::server::{self, AppState};
use audit_ledger::Ledger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("audit_ledger=info,tower_http=info");

    info!("Starting audit ledger");

    let config = AppConfig::load()?;
    info!("Configuration loaded");

    let ledger = Ledger::open(&config).await?;
    let backend = ledger.store().backend_name();

    let app = server::router(AppState { ledger, backend });

    let addr: SocketAddr = format!("{}:{}", config.server_host, config.server_port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
