//! Permission resolution.
//!
//! A principal's capabilities are the union of the permissions linked to
//! every role it holds in its current organization. Checks go through
//! [`ResolvedAccess::allows`], which honours `module:*` and `*:*` grants.
//! An empty role set resolves to nothing, so every check fails closed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::errors::{ClinicError, ClinicResult};
use crate::roles::{Permission, Role, RoleId, RolePermission, RoleStore, SystemRole, UserRole, WILDCARD};
use crate::tenant::{OrganizationId, Principal, UserId};

/// A resolved set of `module:action` grants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    grants: BTreeSet<String>,
}

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: &Permission) {
        self.grants.insert(permission.key());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.grants.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.grants.iter().map(String::as_str)
    }

    /// True iff the set holds `module:action`, `module:*` or `*:*`.
    pub fn allows(&self, module: &str, action: &str) -> bool {
        self.contains(&format!("{module}:{action}"))
            || self.contains(&format!("{module}:{WILDCARD}"))
            || self.contains(&format!("{WILDCARD}:{WILDCARD}"))
    }
}

impl<'a> FromIterator<&'a Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = &'a Permission>>(iter: I) -> Self {
        let mut set = Self::new();
        for p in iter {
            set.insert(p);
        }
        set
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        let mut set = Self::new();
        for p in iter {
            set.insert(&p);
        }
        set
    }
}

/// Outcome of resolving a principal's access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAccess {
    /// Declared `admin`: the role tables are skipped and every check passes,
    /// exactly as a `*:*` grant would.
    Admin,
    /// Union of the permissions linked to the principal's roles.
    Granted(PermissionSet),
}

impl ResolvedAccess {
    pub fn allows(&self, module: &str, action: &str) -> bool {
        match self {
            ResolvedAccess::Admin => true,
            ResolvedAccess::Granted(set) => set.allows(module, action),
        }
    }

    /// `Forbidden("Requires {module}.{action}")` unless allowed.
    pub fn require(&self, module: &str, action: &str) -> ClinicResult<()> {
        if self.allows(module, action) {
            return Ok(());
        }
        Err(ClinicError::forbidden(format!("Requires {module}.{action}")).into_anyhow())
    }

    /// The grants as a flat set; `Admin` expands to `*:*`.
    pub fn to_set(&self) -> PermissionSet {
        match self {
            ResolvedAccess::Admin => [Permission::all()].iter().collect(),
            ResolvedAccess::Granted(set) => set.clone(),
        }
    }
}

/// Cross-request cache of resolved sets keyed by `(organization, user)`.
///
/// Entries live until explicitly invalidated; there is no TTL. The resolver
/// invalidates on every role-assignment and role-permission write it performs.
///
/// Every invalidation also advances a generation. A resolver reads
/// [`generation`](Self::generation) before touching the role tables and hands
/// it back to [`put`](Self::put); a set read before a concurrent write is
/// then dropped instead of cached.
#[derive(Debug, Default)]
pub struct PermissionCache {
    state: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<(OrganizationId, UserId), PermissionSet>,
    user_generations: HashMap<(OrganizationId, UserId), u64>,
    org_generations: HashMap<OrganizationId, u64>,
    global_generation: u64,
}

impl CacheState {
    fn generation(&self, key: &(OrganizationId, UserId)) -> u64 {
        self.global_generation
            + self.org_generations.get(&key.0).copied().unwrap_or(0)
            + self.user_generations.get(key).copied().unwrap_or(0)
    }
}

impl PermissionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, org: &OrganizationId, user: &UserId) -> Option<PermissionSet> {
        self.state.read().entries.get(&(org.clone(), user.clone())).cloned()
    }

    /// Current generation of `(org, user)`; it only ever grows.
    pub fn generation(&self, org: &OrganizationId, user: &UserId) -> u64 {
        self.state.read().generation(&(org.clone(), user.clone()))
    }

    /// Store `set` unless `(org, user)` was invalidated after `generation`
    /// was read. Returns whether the set was stored.
    pub fn put(&self, org: &OrganizationId, user: &UserId, generation: u64, set: PermissionSet) -> bool {
        let key = (org.clone(), user.clone());
        let mut state = self.state.write();
        if state.generation(&key) != generation {
            return false;
        }
        state.entries.insert(key, set);
        true
    }

    pub fn invalidate(&self, org: &OrganizationId, user: &UserId) {
        let key = (org.clone(), user.clone());
        let mut state = self.state.write();
        *state.user_generations.entry(key.clone()).or_default() += 1;
        if state.entries.remove(&key).is_some() {
            debug!(organization_id = %org, user_id = %user, "permission cache entry invalidated");
        }
    }

    pub fn invalidate_org(&self, org: &OrganizationId) {
        let mut state = self.state.write();
        *state.org_generations.entry(org.clone()).or_default() += 1;
        let before = state.entries.len();
        state.entries.retain(|(o, _), _| o != org);
        debug!(organization_id = %org, dropped = before - state.entries.len(), "permission cache invalidated for organization");
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.global_generation += 1;
        state.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }
}

/// Resolves principals to permissions against a [`RoleStore`].
pub struct PermissionResolver<S: RoleStore + ?Sized> {
    store: Arc<S>,
    cache: Option<Arc<PermissionCache>>,
}

impl<S: RoleStore + ?Sized> Clone for PermissionResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: self.cache.clone(),
        }
    }
}

impl<S: RoleStore + ?Sized> PermissionResolver<S> {
    /// Resolver without a cross-request cache.
    pub fn new(store: Arc<S>) -> Self {
        Self { store, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<PermissionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<PermissionCache>> {
        self.cache.as_ref()
    }

    /// Union of the permissions of every role `user` holds in `org`.
    pub async fn resolve_permissions(
        &self,
        user: &UserId,
        org: &OrganizationId,
    ) -> ClinicResult<PermissionSet> {
        let mut generation = None;
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(org, user) {
                debug!(organization_id = %org, user_id = %user, "permission cache hit");
                return Ok(hit);
            }
            generation = Some(cache.generation(org, user));
        }

        let roles = self.store.roles_for_user(user, org).await?;
        let role_ids: Vec<RoleId> = roles
            .into_iter()
            .filter(|r| r.usable_in(org))
            .map(|r| r.id)
            .collect();

        let set = if role_ids.is_empty() {
            PermissionSet::new()
        } else {
            self.store
                .permissions_for_roles(&role_ids)
                .await?
                .into_iter()
                .collect()
        };

        if let (Some(cache), Some(generation)) = (&self.cache, generation) {
            if !cache.put(org, user, generation, set.clone()) {
                debug!(organization_id = %org, user_id = %user, "roles changed during resolution; not cached");
            }
        }
        Ok(set)
    }

    /// Resolve the access of `principal` in its current organization.
    pub async fn resolve(&self, principal: &Principal) -> ClinicResult<ResolvedAccess> {
        let tenant = principal.tenant()?;
        if principal.declared_role.is_admin() {
            return Ok(ResolvedAccess::Admin);
        }
        let set = self
            .resolve_permissions(tenant.user_id(), tenant.organization_id())
            .await?;
        Ok(ResolvedAccess::Granted(set))
    }

    pub async fn has_permission(
        &self,
        principal: &Principal,
        module: &str,
        action: &str,
    ) -> ClinicResult<bool> {
        Ok(self.resolve(principal).await?.allows(module, action))
    }

    /// `Forbidden("Requires {module}.{action}")` unless granted.
    pub async fn require_permission(
        &self,
        principal: &Principal,
        module: &str,
        action: &str,
    ) -> ClinicResult<()> {
        let access = self.resolve(principal).await?;
        if let Err(e) = access.require(module, action) {
            warn!(
                user_id = %principal.user_id,
                module,
                action,
                "permission denied"
            );
            return Err(e);
        }
        Ok(())
    }

    /// Memo for a single request.
    pub fn for_request(&self, principal: Principal) -> RequestPermissions<S> {
        RequestPermissions {
            resolver: self.clone(),
            principal,
            access: OnceCell::new(),
        }
    }

    // ---- Admin tooling ----

    /// Seed the catalog and the system roles for a new organization.
    pub async fn provision_tenant(&self, org: &OrganizationId) -> ClinicResult<Vec<Role>> {
        let mut created = Vec::with_capacity(SystemRole::ALL.len());
        for system in SystemRole::ALL {
            let role = self.store.insert_role(Role::system(org.clone(), system)).await?;
            for permission in system.default_grants() {
                self.store.seed_permission(permission.clone()).await?;
                self.store
                    .insert_role_permission(RolePermission {
                        role_id: role.id.clone(),
                        permission,
                    })
                    .await?;
            }
            created.push(role);
        }
        self.invalidate_org(org);
        Ok(created)
    }

    /// Give `user` the role `role_id` inside `org`.
    ///
    /// A role owned by another organization is reported as missing.
    pub async fn assign_role(
        &self,
        user: &UserId,
        org: &OrganizationId,
        role_id: &RoleId,
    ) -> ClinicResult<()> {
        self.usable_role(role_id, org).await?;
        self.store
            .insert_user_role(UserRole {
                user_id: user.clone(),
                organization_id: org.clone(),
                role_id: role_id.clone(),
            })
            .await?;
        self.invalidate(org, user);
        Ok(())
    }

    pub async fn revoke_role(
        &self,
        user: &UserId,
        org: &OrganizationId,
        role_id: &RoleId,
    ) -> ClinicResult<bool> {
        let removed = self
            .store
            .delete_user_role(&UserRole {
                user_id: user.clone(),
                organization_id: org.clone(),
                role_id: role_id.clone(),
            })
            .await?;
        self.invalidate(org, user);
        Ok(removed)
    }

    /// Link `permission` to a role of `org`. The permission must already be
    /// in the catalog or is seeded on the way.
    pub async fn grant_permission(
        &self,
        org: &OrganizationId,
        role_id: &RoleId,
        permission: Permission,
    ) -> ClinicResult<()> {
        let role = self.usable_role(role_id, org).await?;
        self.store.seed_permission(permission.clone()).await?;
        self.store
            .insert_role_permission(RolePermission {
                role_id: role.id,
                permission,
            })
            .await?;
        self.invalidate_role_owner(&role.organization_id, org);
        Ok(())
    }

    pub async fn revoke_permission(
        &self,
        org: &OrganizationId,
        role_id: &RoleId,
        permission: Permission,
    ) -> ClinicResult<bool> {
        let role = self.usable_role(role_id, org).await?;
        let removed = self
            .store
            .delete_role_permission(&RolePermission {
                role_id: role.id,
                permission,
            })
            .await?;
        self.invalidate_role_owner(&role.organization_id, org);
        Ok(removed)
    }

    async fn usable_role(&self, role_id: &RoleId, org: &OrganizationId) -> ClinicResult<Role> {
        match self.store.role(role_id).await? {
            Some(role) if role.usable_in(org) => Ok(role),
            _ => Err(ClinicError::not_found(format!("Role {role_id} not found")).into_anyhow()),
        }
    }

    fn invalidate(&self, org: &OrganizationId, user: &UserId) {
        if let Some(cache) = &self.cache {
            cache.invalidate(org, user);
        }
    }

    fn invalidate_org(&self, org: &OrganizationId) {
        if let Some(cache) = &self.cache {
            cache.invalidate_org(org);
        }
    }

    // Global roles are shared by every organization, so a change to one
    // drops the whole cache.
    fn invalidate_role_owner(&self, owner: &Option<OrganizationId>, org: &OrganizationId) {
        let Some(cache) = &self.cache else {
            return;
        };
        match owner {
            Some(owner) => cache.invalidate_org(owner),
            None => {
                cache.clear();
                debug!(organization_id = %org, "permission cache cleared after global role change");
            }
        }
    }
}

/// Lazily resolved access for one request; the role tables are read at most
/// once however many checks the handler performs.
pub struct RequestPermissions<S: RoleStore + ?Sized> {
    resolver: PermissionResolver<S>,
    principal: Principal,
    access: OnceCell<ResolvedAccess>,
}

impl<S: RoleStore + ?Sized> RequestPermissions<S> {
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub async fn access(&self) -> ClinicResult<&ResolvedAccess> {
        self.access
            .get_or_try_init(|| self.resolver.resolve(&self.principal))
            .await
    }

    pub async fn has_permission(&self, module: &str, action: &str) -> ClinicResult<bool> {
        Ok(self.access().await?.allows(module, action))
    }

    pub async fn require(&self, module: &str, action: &str) -> ClinicResult<()> {
        self.access().await?.require(module, action)
    }
}
