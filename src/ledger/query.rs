//! Audit Query
//!
//! Tenant-scoped, filtered, paged reads of the ledger for display and
//! reporting. The partition is always supplied by the caller's
//! access-control layer and is never taken from the filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LedgerResult;
use crate::ledger::event::{AuditEvent, TenantKey};
use crate::ledger::Ledger;
use crate::store::LedgerStore;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const MAX_PAGE_SIZE: u32 = 1_000;

/// Filters for a page of audit events. Time bounds are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub action: Option<String>,
    pub actor_id: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl AuditQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// In-process filter, for stores without a query engine.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        fn eq(filter: &Option<String>, value: Option<&str>) -> bool {
            filter.as_deref().map_or(true, |f| value == Some(f))
        }

        eq(&self.action, Some(&event.action))
            && eq(&self.actor_id, event.actor_id.as_deref())
            && eq(&self.resource_type, Some(&event.resource_type))
            && eq(&self.resource_id, event.resource_id.as_deref())
            && self.start.map_or(true, |start| event.event_time >= start)
            && self.end.map_or(true, |end| event.event_time <= end)
    }
}

/// One page of events, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPage {
    pub tenant_key: TenantKey,
    pub events: Vec<AuditEvent>,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

impl AuditPage {
    /// Build a page from rows fetched with `limit + 1`.
    pub fn from_overfetch(
        tenant_key: TenantKey,
        mut events: Vec<AuditEvent>,
        limit: u32,
        offset: u32,
    ) -> Self {
        let has_more = events.len() > limit as usize;
        events.truncate(limit as usize);
        Self {
            tenant_key,
            events,
            limit,
            offset,
            has_more,
        }
    }
}

impl<S: LedgerStore> Ledger<S> {
    /// Query one tenant's events.
    pub async fn query(&self, tenant: &TenantKey, query: &AuditQuery) -> LedgerResult<AuditPage> {
        let page = self.store().query(tenant, query).await?;
        debug!(
            tenant_key = %tenant,
            returned = page.events.len(),
            has_more = page.has_more,
            "audit query served"
        );
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event::NewAuditEvent;
    use chrono::TimeZone;

    fn event(action: &str, actor: &str, minute: u32) -> AuditEvent {
        NewAuditEvent::new(action, "patient")
            .actor_id(actor)
            .resource_id("p-1")
            .event_time(Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).unwrap())
            .seal(TenantKey::system(), 1, "")
    }

    #[test]
    fn test_limits_are_clamped() {
        assert_eq!(AuditQuery::default().effective_limit(), DEFAULT_PAGE_SIZE);
        let q = AuditQuery {
            limit: Some(50_000),
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), MAX_PAGE_SIZE);
        let q = AuditQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), 1);
    }

    #[test]
    fn test_matches_filters() {
        let e = event("patient.view", "u-1", 30);
        assert!(AuditQuery::default().matches(&e));

        let q = AuditQuery {
            action: Some("patient.view".into()),
            actor_id: Some("u-1".into()),
            ..Default::default()
        };
        assert!(q.matches(&e));

        let q = AuditQuery {
            actor_id: Some("u-2".into()),
            ..Default::default()
        };
        assert!(!q.matches(&e));

        let q = AuditQuery {
            start: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap()),
            ..Default::default()
        };
        assert!(q.matches(&e), "time bounds are inclusive");

        let q = AuditQuery {
            end: Some(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()),
            ..Default::default()
        };
        assert!(!q.matches(&e));
    }

    #[test]
    fn test_page_from_overfetch() {
        let events = vec![event("a", "u", 1), event("b", "u", 2), event("c", "u", 3)];
        let page = AuditPage::from_overfetch(TenantKey::system(), events.clone(), 2, 0);
        assert!(page.has_more);
        assert_eq!(page.events.len(), 2);

        let page = AuditPage::from_overfetch(TenantKey::system(), events, 3, 0);
        assert!(!page.has_more);
    }
}
