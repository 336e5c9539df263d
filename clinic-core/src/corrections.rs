//! Correction requests.
//!
//! A correction proposes changes to one tenant-owned row. A reviewer approves
//! or rejects it exactly once; of two concurrent reviews only the first
//! takes effect and the second sees `Conflict`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::audit::{AuditEvent, AuditLogger, AuditSink};
use crate::errors::{ClinicError, ClinicResult};
use crate::scoped::{ScopedAccessor, ScopedTransaction};
use crate::store::{TenantOwned, TenantStore};
use crate::tenant::{OrganizationId, UserId};

pub const CORRECTIONS_TABLE: &str = "correction_requests";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub id: String,
    pub organization_id: OrganizationId,
    pub resource_type: String,
    pub resource_id: String,
    pub changes: Value,
    #[serde(default)]
    pub status: CorrectionStatus,
    pub requested_by: UserId,
    #[serde(default)]
    pub reviewed_by: Option<UserId>,
    #[serde(default)]
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TenantOwned for CorrectionRequest {
    const TABLE: &'static str = CORRECTIONS_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    fn set_organization_id(&mut self, organization_id: OrganizationId) {
        self.organization_id = organization_id;
    }
}

/// File a pending correction against row `resource_id` of `T`.
///
/// The row must be visible to the caller's organization.
pub async fn request_correction<S, T>(
    scoped: &ScopedAccessor<S>,
    resource_id: &str,
    changes: Value,
) -> ClinicResult<CorrectionRequest>
where
    S: TenantStore,
    T: TenantOwned,
{
    if !changes.is_object() {
        return Err(ClinicError::bad_request("Correction changes must be an object").into_anyhow());
    }
    scoped.select::<T>().by_id(resource_id).one().await?;

    let tenant = scoped.tenant();
    let request = CorrectionRequest {
        id: uuid::Uuid::new_v4().to_string(),
        organization_id: tenant.organization_id().clone(),
        resource_type: T::TABLE.to_string(),
        resource_id: resource_id.to_string(),
        changes,
        status: CorrectionStatus::Pending,
        requested_by: tenant.user_id().clone(),
        reviewed_by: None,
        reviewed_at: None,
        created_at: Utc::now(),
    };
    scoped.insert::<CorrectionRequest>().value(request).await
}

/// Apply a pending correction to its `T` row and mark it approved.
///
/// Loading, applying and marking happen in one transaction. The audit entry
/// is written after commit and cannot undo the approval.
pub async fn approve_correction<S, T, A>(
    scoped: &ScopedAccessor<S>,
    audit: &AuditLogger<A>,
    request_id: &str,
) -> ClinicResult<CorrectionRequest>
where
    S: TenantStore,
    T: TenantOwned,
    A: AuditSink + ?Sized + 'static,
{
    let mut tx = scoped.begin().await?;
    let request = pending_request(
        tx.select::<CorrectionRequest>().by_id(request_id).one().await?,
    )?;
    if request.resource_type != T::TABLE {
        return Err(ClinicError::bad_request(format!(
            "Correction targets {}, not {}",
            request.resource_type,
            T::TABLE
        ))
        .into_anyhow());
    }

    let applied = tx
        .update::<T>()
        .by_id(&request.resource_id)
        .set(&request.changes)
        .await?;
    if applied.is_empty() {
        return Err(ClinicError::not_found(format!("{} not found", T::TABLE)).into_anyhow());
    }

    let approved = mark_reviewed(&mut tx, request_id, CorrectionStatus::Approved).await?;
    tx.commit().await?;

    info!(
        organization_id = %approved.organization_id,
        request_id,
        table = T::TABLE,
        "correction approved"
    );
    audit
        .log_audit(
            AuditEvent::new(
                scoped.tenant(),
                "correction.approve",
                format!("{}/{}", approved.resource_type, approved.resource_id),
            )
            .with_details(json!({ "request_id": approved.id, "changes": approved.changes })),
        )
        .await;
    Ok(approved)
}

/// Mark a pending correction rejected without touching its target.
pub async fn reject_correction<S, A>(
    scoped: &ScopedAccessor<S>,
    audit: &AuditLogger<A>,
    request_id: &str,
) -> ClinicResult<CorrectionRequest>
where
    S: TenantStore,
    A: AuditSink + ?Sized + 'static,
{
    let mut tx = scoped.begin().await?;
    pending_request(
        tx.select::<CorrectionRequest>().by_id(request_id).one().await?,
    )?;
    let rejected = mark_reviewed(&mut tx, request_id, CorrectionStatus::Rejected).await?;
    tx.commit().await?;

    audit
        .log_audit(
            AuditEvent::new(
                scoped.tenant(),
                "correction.reject",
                format!("{}/{}", rejected.resource_type, rejected.resource_id),
            )
            .with_details(json!({ "request_id": rejected.id })),
        )
        .await;
    Ok(rejected)
}

fn pending_request(request: CorrectionRequest) -> ClinicResult<CorrectionRequest> {
    if request.status != CorrectionStatus::Pending {
        return Err(ClinicError::conflict("Correction request already processed").into_anyhow());
    }
    Ok(request)
}

async fn mark_reviewed<S: TenantStore>(
    tx: &mut ScopedTransaction<S>,
    request_id: &str,
    status: CorrectionStatus,
) -> ClinicResult<CorrectionRequest> {
    let reviewer = tx.tenant().user_id().clone();
    tx.update::<CorrectionRequest>()
        .by_id(request_id)
        .set(json!({
            "status": status,
            "reviewed_by": reviewer,
            "reviewed_at": Utc::now(),
        }))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ClinicError::not_found(format!("{CORRECTIONS_TABLE} not found")).into_anyhow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::memory::MemoryStore;
    use crate::roles::DeclaredRole;
    use crate::tenant::Principal;
    use std::sync::Arc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Patient {
        id: String,
        organization_id: OrganizationId,
        phone: String,
        #[serde(default)]
        status: Option<String>,
    }

    impl TenantOwned for Patient {
        const TABLE: &'static str = "patients";
        fn id(&self) -> &str {
            &self.id
        }
        fn organization_id(&self) -> &OrganizationId {
            &self.organization_id
        }
        fn set_organization_id(&mut self, organization_id: OrganizationId) {
            self.organization_id = organization_id;
        }
        fn lock_status(&self) -> Option<&str> {
            self.status.as_deref()
        }
    }

    async fn setup() -> (Arc<MemoryStore>, ScopedAccessor<MemoryStore>, AuditLogger<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .seed(
                "patients",
                [
                    json!({"id": "42", "organization_id": "org-1", "phone": "555-0100"}),
                    json!({"id": "77", "organization_id": "org-2", "phone": "555-0177"}),
                ],
            )
            .await;
        let principal = Principal::new("reviewer", Some("org-1".into()), DeclaredRole::Unspecified);
        let scoped = ScopedAccessor::new(Arc::clone(&store), &principal).unwrap();
        let audit = AuditLogger::new(Arc::clone(&store));
        (store, scoped, audit)
    }

    #[tokio::test]
    async fn approval_applies_changes_once() {
        let (_, scoped, audit) = setup().await;
        let req = request_correction::<_, Patient>(&scoped, "42", json!({"phone": "555-0199"}))
            .await
            .unwrap();
        assert_eq!(req.status, CorrectionStatus::Pending);

        let approved = approve_correction::<_, Patient, _>(&scoped, &audit, &req.id).await.unwrap();
        assert_eq!(approved.status, CorrectionStatus::Approved);
        assert_eq!(approved.reviewed_by, Some(UserId::new("reviewer")));

        let patient = scoped.select::<Patient>().by_id("42").one().await.unwrap();
        assert_eq!(patient.phone, "555-0199");

        let err = approve_correction::<_, Patient, _>(&scoped, &audit, &req.id).await.unwrap_err();
        let clinic = ClinicError::from_anyhow(&err).unwrap();
        assert_eq!(clinic.kind, ErrorKind::Conflict);
        assert_eq!(clinic.message, "Correction request already processed");
    }

    #[tokio::test]
    async fn rejection_leaves_target_untouched() {
        let (_, scoped, audit) = setup().await;
        let req = request_correction::<_, Patient>(&scoped, "42", json!({"phone": "000"}))
            .await
            .unwrap();
        let rejected = reject_correction(&scoped, &audit, &req.id).await.unwrap();
        assert_eq!(rejected.status, CorrectionStatus::Rejected);

        let patient = scoped.select::<Patient>().by_id("42").one().await.unwrap();
        assert_eq!(patient.phone, "555-0100");
        let err = approve_correction::<_, Patient, _>(&scoped, &audit, &req.id).await.unwrap_err();
        assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::Conflict));
    }

    #[tokio::test]
    async fn foreign_rows_cannot_be_corrected() {
        let (_, scoped, _) = setup().await;
        let err = request_correction::<_, Patient>(&scoped, "77", json!({"phone": "1"}))
            .await
            .unwrap_err();
        assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn approval_respects_the_lock_guard() {
        let (store, scoped, audit) = setup().await;
        let req = request_correction::<_, Patient>(&scoped, "42", json!({"phone": "1"}))
            .await
            .unwrap();
        scoped
            .update::<Patient>()
            .by_id("42")
            .set(json!({"status": "locked"}))
            .await
            .unwrap();

        let err = approve_correction::<_, Patient, _>(&scoped, &audit, &req.id).await.unwrap_err();
        assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::Locked));

        let rows = store.dump(CORRECTIONS_TABLE).await;
        assert_eq!(rows[0]["status"], json!("pending"));
    }

    #[tokio::test]
    async fn approval_is_audited() {
        let (store, scoped, audit) = setup().await;
        let req = request_correction::<_, Patient>(&scoped, "42", json!({"phone": "2"}))
            .await
            .unwrap();
        approve_correction::<_, Patient, _>(&scoped, &audit, &req.id).await.unwrap();

        let trail = store.audit_entries(&"org-1".into()).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "correction.approve");
        assert_eq!(trail[0].resource, "patients/42");
    }
}
