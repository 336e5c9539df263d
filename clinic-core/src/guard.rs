//! Tenant scope guard.
//!
//! Rejects any operation whose target belongs to an organization other than
//! the caller's. `verify_ownership` must run before a mutating handler uses a
//! caller-supplied id that names an existing row (the IDOR check).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::{ClinicError, ClinicResult};
use crate::store::OwnershipLookup;
use crate::tenant::{canonical_id, OrganizationId, Principal};

/// How a row owned by another organization is reported.
///
/// Applied uniformly by every guard call. `NotFound` hides whether the id
/// exists at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossTenantPolicy {
    #[default]
    NotFound,
    Forbidden,
}

impl CrossTenantPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "not_found" | "notfound" | "404" => Some(Self::NotFound),
            "forbidden" | "403" => Some(Self::Forbidden),
            _ => None,
        }
    }

    fn error(&self, what: &str) -> anyhow::Error {
        match self {
            Self::NotFound => ClinicError::not_found(format!("{what} not found")).into_anyhow(),
            Self::Forbidden => {
                ClinicError::forbidden(format!("Access to {what} is not allowed")).into_anyhow()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TenantGuard {
    policy: CrossTenantPolicy,
}

impl TenantGuard {
    pub fn new(policy: CrossTenantPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> CrossTenantPolicy {
        self.policy
    }

    /// Passes iff `resource_org` names the principal's organization.
    ///
    /// `resource_org` may be a JSON string or number; both sides are compared
    /// in canonical form. A principal without an organization is rejected
    /// with `NoActiveTenant` before any comparison.
    pub fn check_tenant_access(
        &self,
        principal: &Principal,
        resource_org: &Value,
        action: &str,
    ) -> ClinicResult<()> {
        let tenant = principal.tenant()?;
        let own = tenant.organization_id();
        if own.matches(resource_org) {
            return Ok(());
        }
        warn!(
            user_id = %principal.user_id,
            organization_id = %own,
            resource_organization = ?canonical_id(resource_org),
            action,
            "cross-tenant access rejected"
        );
        Err(self.policy.error("Resource"))
    }

    /// Confirms that row `resource_id` of `table` exists and belongs to
    /// `organization_id`.
    ///
    /// A missing row is always `NotFound`; a foreign row follows the policy.
    pub async fn verify_ownership<L>(
        &self,
        lookup: &L,
        resource_id: &str,
        organization_id: &OrganizationId,
        table: &str,
    ) -> ClinicResult<()>
    where
        L: OwnershipLookup + ?Sized,
    {
        let what = format!("{table} {resource_id}");
        match lookup.owner_of(table, resource_id).await? {
            None => Err(ClinicError::not_found(format!("{what} not found")).into_anyhow()),
            Some(owner) if &owner == organization_id => Ok(()),
            Some(_) => {
                warn!(
                    organization_id = %organization_id,
                    table,
                    resource_id,
                    "ownership check failed for foreign row"
                );
                Err(self.policy.error(&what))
            }
        }
    }

    /// [`verify_ownership`](Self::verify_ownership) against the principal's
    /// own organization.
    pub async fn verify_principal_owns<L>(
        &self,
        lookup: &L,
        principal: &Principal,
        resource_id: &str,
        table: &str,
    ) -> ClinicResult<()>
    where
        L: OwnershipLookup + ?Sized,
    {
        let tenant = principal.tenant()?;
        self.verify_ownership(lookup, resource_id, tenant.organization_id(), table)
            .await
    }
}
