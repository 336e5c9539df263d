//! Audit & access log.
//!
//! Two append-only trails: audit entries for sensitive state changes and
//! access entries for reads of personally identifiable detail. Writes are
//! best-effort. A failed write is reported on the operational log and never
//! fails the business operation that triggered it. Neither trail exposes an
//! update or delete path.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::ClinicResult;
use crate::tenant::{OrganizationId, Principal, TenantContext, UserId};

/// A sensitive action about to be recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub action: String,
    pub resource: String,
    pub ip_address: Option<String>,
    pub details: Option<Value>,
}

impl AuditEvent {
    pub fn new(tenant: &TenantContext, action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            user_id: tenant.user_id().clone(),
            organization_id: tenant.organization_id().clone(),
            action: action.into(),
            resource: resource.into(),
            ip_address: None,
            details: None,
        }
    }

    pub fn from_principal(
        principal: &Principal,
        action: impl Into<String>,
        resource: impl Into<String>,
    ) -> ClinicResult<Self> {
        Ok(Self::new(&principal.tenant()?, action, resource))
    }

    pub fn with_ip(mut self, ip: Option<String>) -> Self {
        self.ip_address = ip;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A stored audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub action: String,
    pub resource: String,
    pub ip_address: Option<String>,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl From<AuditEvent> for AuditLogEntry {
    fn from(e: AuditEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: e.user_id,
            organization_id: e.organization_id,
            action: e.action,
            resource: e.resource,
            ip_address: e.ip_address,
            details: e.details,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessAction {
    View,
    Download,
    Search,
}

impl fmt::Display for AccessAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessAction::View => "VIEW",
            AccessAction::Download => "DOWNLOAD",
            AccessAction::Search => "SEARCH",
        })
    }
}

/// A read of personally identifiable data about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEvent {
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub patient_id: Option<String>,
    pub action: AccessAction,
    pub resource_type: String,
    pub resource_id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl AccessEvent {
    pub fn new(
        tenant: &TenantContext,
        action: AccessAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: tenant.organization_id().clone(),
            user_id: tenant.user_id().clone(),
            patient_id: None,
            action,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            ip: None,
            user_agent: None,
        }
    }

    pub fn from_principal(
        principal: &Principal,
        action: AccessAction,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> ClinicResult<Self> {
        Ok(Self::new(&principal.tenant()?, action, resource_type, resource_id))
    }

    pub fn for_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn with_client(mut self, ip: Option<String>, user_agent: Option<String>) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub id: Uuid,
    pub organization_id: OrganizationId,
    pub user_id: UserId,
    pub patient_id: Option<String>,
    pub action: AccessAction,
    pub resource_type: String,
    pub resource_id: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<AccessEvent> for AccessLogEntry {
    fn from(e: AccessEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: e.organization_id,
            user_id: e.user_id,
            patient_id: e.patient_id,
            action: e.action,
            resource_type: e.resource_type,
            resource_id: e.resource_id,
            ip: e.ip,
            user_agent: e.user_agent,
            created_at: Utc::now(),
        }
    }
}

/// Append-only persistence for both trails, plus the read queries used for
/// compliance reporting.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append_audit(&self, entry: AuditLogEntry) -> ClinicResult<()>;

    async fn append_access(&self, entry: AccessLogEntry) -> ClinicResult<()>;

    async fn audit_entries(&self, org: &OrganizationId) -> ClinicResult<Vec<AuditLogEntry>>;

    async fn access_entries_for_patient(
        &self,
        org: &OrganizationId,
        patient_id: &str,
    ) -> ClinicResult<Vec<AccessLogEntry>>;
}

/// Fire-and-forget front for an [`AuditSink`].
pub struct AuditLogger<A: AuditSink + ?Sized + 'static> {
    sink: Arc<A>,
    detached: bool,
}

impl<A: AuditSink + ?Sized + 'static> Clone for AuditLogger<A> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            detached: self.detached,
        }
    }
}

impl<A: AuditSink + ?Sized + 'static> AuditLogger<A> {
    pub fn new(sink: Arc<A>) -> Self {
        Self {
            sink,
            detached: false,
        }
    }

    /// Spawn writes onto the runtime instead of awaiting them.
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    pub fn sink(&self) -> &Arc<A> {
        &self.sink
    }

    /// Record a sensitive action. Never fails.
    pub async fn log_audit(&self, event: AuditEvent) {
        let entry = AuditLogEntry::from(event);
        let sink = Arc::clone(&self.sink);
        let write = async move {
            let (org, action) = (entry.organization_id.clone(), entry.action.clone());
            match sink.append_audit(entry).await {
                Ok(()) => debug!(organization_id = %org, action = %action, "audit entry written"),
                Err(e) => error!(
                    organization_id = %org,
                    action = %action,
                    error = %e,
                    "audit write failed"
                ),
            }
        };
        self.dispatch(write).await;
    }

    /// Record a read of personal data. Never fails.
    pub async fn log_access(&self, event: AccessEvent) {
        let entry = AccessLogEntry::from(event);
        let sink = Arc::clone(&self.sink);
        let write = async move {
            let (org, action) = (entry.organization_id.clone(), entry.action);
            match sink.append_access(entry).await {
                Ok(()) => debug!(organization_id = %org, action = %action, "access entry written"),
                Err(e) => error!(
                    organization_id = %org,
                    action = %action,
                    error = %e,
                    "access log write failed"
                ),
            }
        };
        self.dispatch(write).await;
    }

    /// Every recorded access to `patient_id` within the caller's organization.
    pub async fn access_report(
        &self,
        principal: &Principal,
        patient_id: &str,
    ) -> ClinicResult<Vec<AccessLogEntry>> {
        let tenant = principal.tenant()?;
        self.sink
            .access_entries_for_patient(tenant.organization_id(), patient_id)
            .await
    }

    pub async fn audit_trail(&self, principal: &Principal) -> ClinicResult<Vec<AuditLogEntry>> {
        let tenant = principal.tenant()?;
        self.sink.audit_entries(tenant.organization_id()).await
    }

    async fn dispatch<F>(&self, write: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if self.detached {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(write);
                return;
            }
        }
        write.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::roles::DeclaredRole;
    use serde_json::json;
    use tracing_test::traced_test;

    fn principal(org: &str) -> Principal {
        Principal::new("dr-ada", Some(org.into()), DeclaredRole::Unspecified)
    }

    #[tokio::test]
    async fn audit_entries_are_stamped_and_stored() {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(Arc::clone(&store));
        let p = principal("org-1");

        let event = AuditEvent::from_principal(&p, "note.sign", "clinical_notes/n-1")
            .unwrap()
            .with_ip(Some("10.0.0.7".to_string()))
            .with_details(json!({"reason": "visit complete"}));
        logger.log_audit(event).await;

        let trail = logger.audit_trail(&p).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "note.sign");
        assert_eq!(trail[0].ip_address.as_deref(), Some("10.0.0.7"));
        assert!(logger.audit_trail(&principal("org-2")).await.unwrap().is_empty());
    }

    #[traced_test]
    #[tokio::test]
    async fn failed_audit_write_is_reported_not_raised() {
        let store = Arc::new(MemoryStore::new());
        store.fail_audit_writes(true);
        let logger = AuditLogger::new(Arc::clone(&store));

        let event = AuditEvent::from_principal(&principal("org-1"), "correction.approve", "patients/42").unwrap();
        logger.log_audit(event).await;

        assert!(logs_contain("audit write failed"));
        assert!(store.audit_entries(&"org-1".into()).await.unwrap().is_empty());
    }

    #[traced_test]
    #[tokio::test]
    async fn failed_access_write_is_reported_not_raised() {
        let store = Arc::new(MemoryStore::new());
        store.fail_audit_writes(true);
        let logger = AuditLogger::new(Arc::clone(&store));

        let event = AccessEvent::from_principal(&principal("org-1"), AccessAction::View, "patients", "42")
            .unwrap()
            .for_patient("42");
        logger.log_access(event).await;

        assert!(logs_contain("access log write failed"));
    }

    #[tokio::test]
    async fn access_report_is_scoped_to_caller_org() {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(Arc::clone(&store));

        for (org, action) in [("org-1", AccessAction::View), ("org-1", AccessAction::Download), ("org-2", AccessAction::View)] {
            let event = AccessEvent::from_principal(&principal(org), action, "patients", "42")
                .unwrap()
                .for_patient("42")
                .with_client(Some("10.1.1.1".into()), Some("curl/8".into()));
            logger.log_access(event).await;
        }

        let report = logger.access_report(&principal("org-1"), "42").await.unwrap();
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|e| e.organization_id.as_str() == "org-1"));
        assert_eq!(report[1].action, AccessAction::Download);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn detached_writes_land_eventually() {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(Arc::clone(&store)).detached(true);
        let p = principal("org-1");

        logger
            .log_audit(AuditEvent::from_principal(&p, "timeline.view", "patients/42").unwrap())
            .await;

        for _ in 0..50 {
            if !store.audit_entries(&"org-1".into()).await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("detached audit write never landed");
    }

    #[test]
    fn access_actions_serialize_upper_case() {
        assert_eq!(serde_json::to_value(AccessAction::Download).unwrap(), json!("DOWNLOAD"));
        assert_eq!(AccessAction::Search.to_string(), "SEARCH");
    }
}
