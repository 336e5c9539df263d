//! In-memory backend.
//!
//! Implements every storage seam of the crate over plain maps. Transactions
//! hold the table lock for their whole lifetime and work on a copy that is
//! swapped in on commit, so concurrent transactions are serialized and a
//! dropped one leaves no trace.
//!
//! Used by the test suites and by embedders that want the access rules
//! without a database.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::audit::{AccessLogEntry, AuditLogEntry, AuditSink};
use crate::errors::{ClinicError, ClinicResult};
use crate::roles::{Permission, Role, RoleId, RolePermission, RoleStore, UserRole};
use crate::store::{
    Filter, OwnershipLookup, StoreError, StoreTransaction, TenantStore, ID_COLUMN,
    ORGANIZATION_COLUMN,
};
use crate::tenant::{canonical_id, OrganizationId, UserId};

type Tables = HashMap<String, Vec<Value>>;

#[derive(Debug, Default)]
struct RoleTables {
    roles: HashMap<RoleId, Role>,
    catalog: BTreeSet<Permission>,
    role_permissions: HashSet<RolePermission>,
    user_roles: HashSet<UserRole>,
}

#[derive(Debug, Default)]
struct AuditTables {
    audit: Vec<AuditLogEntry>,
    access: Vec<AccessLogEntry>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    roles: RwLock<RoleTables>,
    audit: RwLock<AuditTables>,
    failing_tables: Arc<RwLock<HashSet<String>>>,
    fail_audit: AtomicBool,
    role_reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put raw rows into `table`, bypassing every scope. Fixture use only.
    pub async fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        self.tables
            .lock()
            .await
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Raw contents of `table` across all organizations.
    pub async fn dump(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .await
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every write to `table` fail until switched off again.
    pub fn fail_writes_to(&self, table: &str, fail: bool) {
        let mut failing = self.failing_tables.write();
        if fail {
            failing.insert(table.to_string());
        } else {
            failing.remove(table);
        }
    }

    pub fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// How many times role assignments have been read.
    pub fn role_reads(&self) -> usize {
        self.role_reads.load(Ordering::SeqCst)
    }
}

pub struct MemoryTransaction {
    committed: OwnedMutexGuard<Tables>,
    working: Tables,
    failing_tables: Arc<RwLock<HashSet<String>>>,
}

impl MemoryTransaction {
    fn check_writable(&self, table: &str) -> ClinicResult<()> {
        if self.failing_tables.read().contains(table) {
            return Err(ClinicError::from(StoreError::WriteFailed(format!(
                "writes to {table} are disabled"
            )))
            .into_anyhow());
        }
        Ok(())
    }
}

fn same_id(a: &Value, b: &Value) -> bool {
    match (canonical_id(a), canonical_id(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn select(&mut self, table: &str, filter: &Filter) -> ClinicResult<Vec<Value>> {
        let rows = self.working.get(table).map(Vec::as_slice).unwrap_or(&[]);
        let matched = rows.iter().filter(|r| filter.matches(r)).cloned();
        Ok(match filter.max_rows() {
            Some(n) => matched.take(n).collect(),
            None => matched.collect(),
        })
    }

    async fn insert(&mut self, table: &str, rows: Vec<Value>) -> ClinicResult<Vec<Value>> {
        self.check_writable(table)?;
        let existing = self.working.entry(table.to_string()).or_default();
        let mut inserted = Vec::with_capacity(rows.len());
        for mut row in rows {
            let Some(obj) = row.as_object_mut() else {
                return Err(
                    ClinicError::from(StoreError::NotAnObject(table.to_string())).into_anyhow()
                );
            };
            let id = match obj.get(ID_COLUMN).and_then(canonical_id) {
                Some(id) => id,
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    obj.insert(ID_COLUMN.to_string(), Value::String(id.clone()));
                    id
                }
            };
            let id_value = Value::String(id.clone());
            let clash = existing
                .iter()
                .chain(inserted.iter())
                .any(|r: &Value| r.get(ID_COLUMN).is_some_and(|v| same_id(v, &id_value)));
            if clash {
                return Err(ClinicError::from(StoreError::DuplicateId {
                    table: table.to_string(),
                    id,
                })
                .into_anyhow());
            }
            inserted.push(row);
        }
        existing.extend(inserted.iter().cloned());
        Ok(inserted)
    }

    async fn update(
        &mut self,
        table: &str,
        filter: &Filter,
        patch: &Map<String, Value>,
    ) -> ClinicResult<Vec<Value>> {
        self.check_writable(table)?;
        let mut updated = Vec::new();
        if let Some(rows) = self.working.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                if let Some(obj) = row.as_object_mut() {
                    for (k, v) in patch {
                        obj.insert(k.clone(), v.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&mut self, table: &str, filter: &Filter) -> ClinicResult<Vec<Value>> {
        self.check_writable(table)?;
        let Some(rows) = self.working.get_mut(table) else {
            return Ok(Vec::new());
        };
        let (removed, kept): (Vec<Value>, Vec<Value>) =
            rows.drain(..).partition(|r| filter.matches(r));
        *rows = kept;
        Ok(removed)
    }

    async fn commit(mut self) -> ClinicResult<()> {
        *self.committed = std::mem::take(&mut self.working);
        Ok(())
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> ClinicResult<MemoryTransaction> {
        let committed = Arc::clone(&self.tables).lock_owned().await;
        let working = committed.clone();
        Ok(MemoryTransaction {
            committed,
            working,
            failing_tables: Arc::clone(&self.failing_tables),
        })
    }
}

/// Waits for the table lock; do not call from a task holding an open
/// [`MemoryTransaction`].
#[async_trait]
impl OwnershipLookup for MemoryStore {
    async fn owner_of(&self, table: &str, id: &str) -> ClinicResult<Option<OrganizationId>> {
        let wanted = Value::String(id.to_string());
        let tables = self.tables.lock().await;
        let owner = tables
            .get(table)
            .and_then(|rows| {
                rows.iter()
                    .find(|r| r.get(ID_COLUMN).is_some_and(|v| same_id(v, &wanted)))
            })
            .and_then(|r| r.get(ORGANIZATION_COLUMN))
            .and_then(OrganizationId::from_value);
        Ok(owner)
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn roles_for_user(&self, user: &UserId, org: &OrganizationId) -> ClinicResult<Vec<Role>> {
        self.role_reads.fetch_add(1, Ordering::SeqCst);
        let t = self.roles.read();
        Ok(t.user_roles
            .iter()
            .filter(|link| &link.user_id == user && &link.organization_id == org)
            .filter_map(|link| t.roles.get(&link.role_id).cloned())
            .collect())
    }

    async fn permissions_for_roles(&self, role_ids: &[RoleId]) -> ClinicResult<Vec<Permission>> {
        let t = self.roles.read();
        let found: BTreeSet<Permission> = t
            .role_permissions
            .iter()
            .filter(|link| role_ids.contains(&link.role_id))
            .map(|link| link.permission.clone())
            .collect();
        Ok(found.into_iter().collect())
    }

    async fn role(&self, id: &RoleId) -> ClinicResult<Option<Role>> {
        Ok(self.roles.read().roles.get(id).cloned())
    }

    async fn roles_in(&self, org: &OrganizationId) -> ClinicResult<Vec<Role>> {
        let mut roles: Vec<Role> = self
            .roles
            .read()
            .roles
            .values()
            .filter(|r| r.organization_id.as_ref() == Some(org))
            .cloned()
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn insert_role(&self, role: Role) -> ClinicResult<Role> {
        let mut t = self.roles.write();
        if t.roles.contains_key(&role.id) {
            return Err(ClinicError::from(StoreError::DuplicateId {
                table: "roles".to_string(),
                id: role.id.to_string(),
            })
            .into_anyhow());
        }
        t.roles.insert(role.id.clone(), role.clone());
        Ok(role)
    }

    async fn seed_permission(&self, permission: Permission) -> ClinicResult<()> {
        self.roles.write().catalog.insert(permission);
        Ok(())
    }

    async fn insert_user_role(&self, link: UserRole) -> ClinicResult<()> {
        let mut t = self.roles.write();
        if !t.roles.contains_key(&link.role_id) {
            return Err(ClinicError::not_found(format!("Role {} not found", link.role_id)).into_anyhow());
        }
        t.user_roles.insert(link);
        Ok(())
    }

    async fn delete_user_role(&self, link: &UserRole) -> ClinicResult<bool> {
        Ok(self.roles.write().user_roles.remove(link))
    }

    async fn insert_role_permission(&self, link: RolePermission) -> ClinicResult<()> {
        let mut t = self.roles.write();
        if !t.roles.contains_key(&link.role_id) {
            return Err(ClinicError::not_found(format!("Role {} not found", link.role_id)).into_anyhow());
        }
        if !t.catalog.contains(&link.permission) {
            return Err(ClinicError::bad_request(format!(
                "Permission {} is not in the catalog",
                link.permission
            ))
            .into_anyhow());
        }
        t.role_permissions.insert(link);
        Ok(())
    }

    async fn delete_role_permission(&self, link: &RolePermission) -> ClinicResult<bool> {
        Ok(self.roles.write().role_permissions.remove(link))
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn append_audit(&self, entry: AuditLogEntry) -> ClinicResult<()> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(ClinicError::from(StoreError::WriteFailed("audit log unavailable".into())).into_anyhow());
        }
        self.audit.write().audit.push(entry);
        Ok(())
    }

    async fn append_access(&self, entry: AccessLogEntry) -> ClinicResult<()> {
        if self.fail_audit.load(Ordering::SeqCst) {
            return Err(ClinicError::from(StoreError::WriteFailed("access log unavailable".into())).into_anyhow());
        }
        self.audit.write().access.push(entry);
        Ok(())
    }

    async fn audit_entries(&self, org: &OrganizationId) -> ClinicResult<Vec<AuditLogEntry>> {
        Ok(self
            .audit
            .read()
            .audit
            .iter()
            .filter(|e| &e.organization_id == org)
            .cloned()
            .collect())
    }

    async fn access_entries_for_patient(
        &self,
        org: &OrganizationId,
        patient_id: &str,
    ) -> ClinicResult<Vec<AccessLogEntry>> {
        Ok(self
            .audit
            .read()
            .access
            .iter()
            .filter(|e| &e.organization_id == org && e.patient_id.as_deref() == Some(patient_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use serde_json::json;

    fn org(id: &str) -> Filter {
        Filter::for_organization(OrganizationId::new(id))
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert("patients", vec![json!({"id": "1", "organization_id": "org-1"})])
                .await
                .unwrap();
        }
        assert!(store.dump("patients").await.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert("patients", vec![json!({"id": "1", "organization_id": "org-1"})])
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.dump("patients").await.len(), 1);
    }

    #[tokio::test]
    async fn insert_assigns_ids_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let rows = tx
            .insert("patients", vec![json!({"organization_id": "org-1"})])
            .await
            .unwrap();
        assert!(rows[0]["id"].as_str().is_some_and(|s| !s.is_empty()));

        tx.insert("patients", vec![json!({"id": 5, "organization_id": "org-1"})])
            .await
            .unwrap();
        let err = tx
            .insert("patients", vec![json!({"id": "5", "organization_id": "org-2"})])
            .await
            .unwrap_err();
        assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::Conflict));
    }

    #[tokio::test]
    async fn update_and_delete_respect_filter_scope() {
        let store = MemoryStore::new();
        store
            .seed(
                "patients",
                [
                    json!({"id": "1", "organization_id": "org-1", "name": "A"}),
                    json!({"id": "2", "organization_id": "org-2", "name": "B"}),
                ],
            )
            .await;

        let mut tx = store.begin().await.unwrap();
        let mut patch = Map::new();
        patch.insert("name".into(), json!("Z"));
        let updated = tx.update("patients", &org("org-1"), &patch).await.unwrap();
        assert_eq!(updated.len(), 1);
        let removed = tx.delete("patients", &org("org-1").eq("id", json!("2"))).await.unwrap();
        assert!(removed.is_empty());
        tx.commit().await.unwrap();

        let rows = store.dump("patients").await;
        assert_eq!(rows[1]["name"], json!("B"));
        assert_eq!(rows[0]["name"], json!("Z"));
    }

    #[tokio::test]
    async fn injected_write_failures_surface_as_general_errors() {
        let store = MemoryStore::new();
        store.fail_writes_to("clinical_notes", true);
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert("clinical_notes", vec![json!({"organization_id": "org-1"})])
            .await
            .unwrap_err();
        assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::GeneralError));
    }

    #[tokio::test]
    async fn owner_lookup_reports_only_the_organization() {
        let store = MemoryStore::new();
        store
            .seed("patients", [json!({"id": 42, "organization_id": 2, "name": "B"})])
            .await;
        assert_eq!(
            store.owner_of("patients", "42").await.unwrap(),
            Some(OrganizationId::new("2"))
        );
        assert_eq!(store.owner_of("patients", "43").await.unwrap(), None);
    }

    #[tokio::test]
    async fn role_permission_links_require_catalog_entries() {
        let store = MemoryStore::new();
        let role = store.insert_role(Role::custom("org-1".into(), "x")).await.unwrap();
        let link = RolePermission {
            role_id: role.id.clone(),
            permission: Permission::new("clinical", "sign"),
        };
        let err = store.insert_role_permission(link.clone()).await.unwrap_err();
        assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::BadRequest));

        store.seed_permission(link.permission.clone()).await.unwrap();
        store.insert_role_permission(link.clone()).await.unwrap();
        assert!(store.delete_role_permission(&link).await.unwrap());
        assert!(!store.delete_role_permission(&link).await.unwrap());
    }
}
