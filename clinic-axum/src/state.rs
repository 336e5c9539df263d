use std::sync::Arc;

use clinic_auth::IdentityResolver;
use clinic_core::{
    AccessSettings, AuditLogger, AuditSink, ClinicResult, OwnershipLookup, PermissionCache,
    PermissionResolver, Principal, RoleStore, ScopedAccessor, TenantGuard, TenantStore,
};

/// Everything a clinic backend has to provide.
pub trait ClinicBackend: TenantStore + OwnershipLookup + RoleStore + AuditSink + 'static {}

impl<T> ClinicBackend for T where T: TenantStore + OwnershipLookup + RoleStore + AuditSink + 'static {}

/// Shared state for clinic routes.
pub struct ClinicState<S: ClinicBackend> {
    pub identity: Arc<dyn IdentityResolver>,
    pub permissions: PermissionResolver<S>,
    pub store: Arc<S>,
    pub audit: AuditLogger<S>,
    pub guard: TenantGuard,
}

impl<S: ClinicBackend> Clone for ClinicState<S> {
    fn clone(&self) -> Self {
        Self {
            identity: Arc::clone(&self.identity),
            permissions: self.permissions.clone(),
            store: Arc::clone(&self.store),
            audit: self.audit.clone(),
            guard: self.guard,
        }
    }
}

impl<S: ClinicBackend> ClinicState<S> {
    pub fn new(store: Arc<S>, identity: Arc<dyn IdentityResolver>, settings: AccessSettings) -> Self {
        let mut permissions = PermissionResolver::new(Arc::clone(&store));
        if settings.permission_cache {
            permissions = permissions.with_cache(Arc::new(PermissionCache::new()));
        }
        Self {
            identity,
            permissions,
            audit: AuditLogger::new(Arc::clone(&store)).detached(settings.audit_detached),
            guard: TenantGuard::new(settings.cross_tenant),
            store,
        }
    }

    /// Data accessor pinned to the principal's organization.
    pub fn scoped(&self, principal: &Principal) -> ClinicResult<ScopedAccessor<S>> {
        ScopedAccessor::new(Arc::clone(&self.store), principal)
    }

    /// Middleware state requiring `module:action`.
    pub fn gate(&self, module: &'static str, action: &'static str) -> PermissionGate<S> {
        PermissionGate {
            state: self.clone(),
            module,
            action,
        }
    }
}

/// State carried by [`require_permission`](crate::require_permission).
pub struct PermissionGate<S: ClinicBackend> {
    pub state: ClinicState<S>,
    pub module: &'static str,
    pub action: &'static str,
}

impl<S: ClinicBackend> Clone for PermissionGate<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            module: self.module,
            action: self.action,
        }
    }
}
