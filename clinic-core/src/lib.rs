//! clinic-core: tenant isolation and access control for ClinicRS.

pub mod audit;
pub mod config;
pub mod corrections;
pub mod errors;
pub mod guard;
pub mod lock;
pub mod memory;
pub mod permissions;
pub mod roles;
pub mod scoped;
pub mod store;
pub mod tenant;

pub use audit::{
    AccessAction, AccessEvent, AccessLogEntry, AuditEvent, AuditLogEntry, AuditLogger, AuditSink,
};
pub use config::{AccessSettings, ClinicConfig, ClinicConfigSnapshot};
pub use corrections::{
    approve_correction, reject_correction, request_correction, CorrectionRequest, CorrectionStatus,
};
pub use errors::{ClinicError, ClinicResult, ErrorKind};
pub use guard::{CrossTenantPolicy, TenantGuard};
pub use lock::{can_edit, ensure_editable, get_lock_reason, StatusBearing, TERMINAL_STATUSES};
pub use memory::{MemoryStore, MemoryTransaction};
pub use permissions::{
    PermissionCache, PermissionResolver, PermissionSet, RequestPermissions, ResolvedAccess,
};
pub use roles::{
    DeclaredRole, Permission, Role, RoleId, RolePermission, RoleStore, SystemRole, UserRole,
};
pub use scoped::{ScopedAccessor, ScopedTransaction};
pub use store::{
    Filter, OwnershipLookup, StoreError, StoreTransaction, TenantOwned, TenantStore,
    ORGANIZATION_COLUMN,
};
pub use tenant::{canonical_id, OrganizationId, Principal, TenantContext, UserId};
