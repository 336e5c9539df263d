//! Core multi-tenant types for ClinicRS.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ClinicError, ClinicResult};
use crate::roles::DeclaredRole;

/// Normalize an identifier to its canonical comparable form.
///
/// Ids arrive as JSON strings, JSON numbers or numeric-as-text; all of them
/// compare as trimmed strings. `null`, booleans and compound values have no
/// canonical form.
pub fn canonical_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// The isolation boundary: one clinic, lab or account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(String);

impl OrganizationId {
    /// Builds an id from any string-ish input; surrounding whitespace is
    /// dropped so `"42"` and `" 42 "` compare equal.
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(id.as_ref().trim().to_string())
    }

    /// Canonical form of a JSON value, `None` when it cannot name an org.
    pub fn from_value(value: &Value) -> Option<Self> {
        canonical_id(value).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when this id and `other` name the same organization.
    pub fn matches(&self, other: &Value) -> bool {
        canonical_id(other).as_deref() == Some(self.as_str())
    }
}

impl fmt::Display for OrganizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrganizationId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OrganizationId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new<S: AsRef<str>>(id: S) -> Self {
        Self(id.as_ref().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The resolved identity of one request.
///
/// Built per request from a verified credential and never persisted.
/// `organization_id` is optional here: a user between organizations still
/// authenticates, but every tenant-scoped operation demands a
/// [`TenantContext`] and fails with `NoActiveTenant` without one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: UserId,
    pub organization_id: Option<OrganizationId>,
    pub declared_role: DeclaredRole,
}

impl Principal {
    pub fn new(
        user_id: impl Into<UserId>,
        organization_id: Option<OrganizationId>,
        declared_role: DeclaredRole,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_id,
            declared_role,
        }
    }

    /// The tenant this principal acts for, or `NoActiveTenant`.
    pub fn tenant(&self) -> ClinicResult<TenantContext> {
        match &self.organization_id {
            Some(org) if !org.as_str().is_empty() => Ok(TenantContext {
                organization_id: org.clone(),
                user_id: self.user_id.clone(),
            }),
            _ => Err(ClinicError::no_active_tenant("No active organization for this request")
                .into_anyhow()),
        }
    }
}

/// Proof that a request carries an organization.
///
/// Only obtainable through [`Principal::tenant`], so anything that takes a
/// `TenantContext` cannot run without a tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    organization_id: OrganizationId,
    user_id: UserId,
}

impl TenantContext {
    pub fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    #[test]
    fn numeric_and_textual_ids_compare_equal() {
        let org = OrganizationId::new("42");
        assert!(org.matches(&json!(42)));
        assert!(org.matches(&json!(" 42 ")));
        assert!(!org.matches(&json!("420")));
        assert!(!org.matches(&Value::Null));
    }

    #[test]
    fn principal_without_org_has_no_tenant() {
        let p = Principal::new("u-1", None, DeclaredRole::default());
        let err = p.tenant().unwrap_err();
        assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::NoActiveTenant));

        let blank = Principal::new("u-1", Some(OrganizationId::new("  ")), DeclaredRole::default());
        assert!(blank.tenant().is_err());
    }

    #[test]
    fn principal_with_org_yields_tenant() {
        let p = Principal::new("u-1", Some("org-1".into()), DeclaredRole::default());
        let t = p.tenant().unwrap();
        assert_eq!(t.organization_id().as_str(), "org-1");
        assert_eq!(t.user_id().as_str(), "u-1");
    }
}
