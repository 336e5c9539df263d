//! Roles, the permission catalog and the role store seam.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{ClinicError, ClinicResult};
use crate::tenant::{OrganizationId, UserId};

/// Wildcard token for either half of a permission.
pub const WILDCARD: &str = "*";

/// A `module:action` capability, e.g. `clinical:view` or `financial:*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission {
    pub module: String,
    pub action: String,
}

impl Permission {
    pub fn new(module: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            action: action.into(),
        }
    }

    /// `*:*`
    pub fn all() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    /// Parse `module:action`. Both halves must be non-empty and the string
    /// must contain exactly one colon.
    pub fn parse(s: &str) -> ClinicResult<Self> {
        let invalid = || {
            ClinicError::bad_request(format!("Invalid permission '{s}', expected module:action"))
                .into_anyhow()
        };
        let (module, action) = s.trim().split_once(':').ok_or_else(invalid)?;
        let (module, action) = (module.trim(), action.trim());
        if module.is_empty() || action.is_empty() || action.contains(':') {
            return Err(invalid());
        }
        Ok(Self::new(module, action))
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.module, self.action)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.action)
    }
}

impl FromStr for Permission {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Permission {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.key()
    }
}

/// Roles every organization is provisioned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemRole {
    Admin,
    Dentist,
    Hygienist,
    Assistant,
    Receptionist,
    Billing,
    LabTechnician,
}

impl SystemRole {
    pub const ALL: [SystemRole; 7] = [
        SystemRole::Admin,
        SystemRole::Dentist,
        SystemRole::Hygienist,
        SystemRole::Assistant,
        SystemRole::Receptionist,
        SystemRole::Billing,
        SystemRole::LabTechnician,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SystemRole::Admin => "admin",
            SystemRole::Dentist => "dentist",
            SystemRole::Hygienist => "hygienist",
            SystemRole::Assistant => "assistant",
            SystemRole::Receptionist => "receptionist",
            SystemRole::Billing => "billing",
            SystemRole::LabTechnician => "lab_technician",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|r| r.name().eq_ignore_ascii_case(name))
    }

    /// Permissions seeded for this role at tenant provisioning.
    pub fn default_grants(&self) -> Vec<Permission> {
        let grants: &[&str] = match self {
            SystemRole::Admin => &["*:*"],
            SystemRole::Dentist => &[
                "clinical:*",
                "patients:*",
                "scheduling:*",
                "lab:view",
                "lab:create",
                "financial:view",
                "inventory:view",
            ],
            SystemRole::Hygienist => &[
                "clinical:view",
                "clinical:edit",
                "patients:view",
                "scheduling:view",
            ],
            SystemRole::Assistant => &[
                "clinical:view",
                "patients:view",
                "scheduling:*",
                "inventory:*",
                "lab:view",
            ],
            SystemRole::Receptionist => &[
                "patients:view",
                "patients:create",
                "patients:edit",
                "scheduling:*",
                "financial:view",
            ],
            SystemRole::Billing => &["financial:*", "patients:view"],
            SystemRole::LabTechnician => &["lab:*"],
        };
        grants
            .iter()
            .filter_map(|g| Permission::parse(g).ok())
            .collect()
    }
}

/// The role a credential claims for its holder.
///
/// Only [`SystemRole::Admin`] changes resolution (it bypasses the table
/// lookup); every other value is informational and the granted set always
/// comes from the user's role assignments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DeclaredRole {
    System(SystemRole),
    Custom(String),
    #[default]
    Unspecified,
}

impl DeclaredRole {
    pub fn parse(name: Option<&str>) -> Self {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => DeclaredRole::Unspecified,
            Some(n) => SystemRole::from_name(n)
                .map(DeclaredRole::System)
                .unwrap_or_else(|| DeclaredRole::Custom(n.to_string())),
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, DeclaredRole::System(SystemRole::Admin))
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            DeclaredRole::System(r) => Some(r.name()),
            DeclaredRole::Custom(n) => Some(n),
            DeclaredRole::Unspecified => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleId(pub String);

impl RoleId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A role owned by one organization, or global when `organization_id` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub organization_id: Option<OrganizationId>,
    pub name: String,
    pub is_system: bool,
}

impl Role {
    pub fn custom(organization_id: OrganizationId, name: impl Into<String>) -> Self {
        Self {
            id: RoleId::generate(),
            organization_id: Some(organization_id),
            name: name.into(),
            is_system: false,
        }
    }

    pub fn system(organization_id: OrganizationId, role: SystemRole) -> Self {
        Self {
            id: RoleId::generate(),
            organization_id: Some(organization_id),
            name: role.name().to_string(),
            is_system: true,
        }
    }

    /// Whether members of `org` may hold this role.
    pub fn usable_in(&self, org: &OrganizationId) -> bool {
        self.organization_id.as_ref().map_or(true, |owner| owner == org)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: RoleId,
    pub permission: Permission,
}

/// A user's role in one organization. The same user can hold different
/// roles in different organizations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRole {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub role_id: RoleId,
}

/// Storage for roles, the permission catalog and both link tables.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Roles linked to `user` inside `org` through `UserRole` rows.
    async fn roles_for_user(&self, user: &UserId, org: &OrganizationId) -> ClinicResult<Vec<Role>>;

    /// Permissions linked to any of `role_ids`.
    async fn permissions_for_roles(&self, role_ids: &[RoleId]) -> ClinicResult<Vec<Permission>>;

    async fn role(&self, id: &RoleId) -> ClinicResult<Option<Role>>;

    async fn roles_in(&self, org: &OrganizationId) -> ClinicResult<Vec<Role>>;

    async fn insert_role(&self, role: Role) -> ClinicResult<Role>;

    /// Add to the global catalog; idempotent.
    async fn seed_permission(&self, permission: Permission) -> ClinicResult<()>;

    async fn insert_user_role(&self, link: UserRole) -> ClinicResult<()>;

    async fn delete_user_role(&self, link: &UserRole) -> ClinicResult<bool>;

    async fn insert_role_permission(&self, link: RolePermission) -> ClinicResult<()>;

    async fn delete_role_permission(&self, link: &RolePermission) -> ClinicResult<bool>;
}
