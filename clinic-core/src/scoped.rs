//! Scoped data accessor.
//!
//! Every verb is pinned to the caller's organization:
//!
//! - `select` filters on `organization_id`
//! - `insert` stamps `organization_id` on every row, replacing whatever the
//!   caller put there
//! - `update` / `delete` filter on `organization_id`, so an id guessed from
//!   another tenant matches nothing
//!
//! An accessor can only be built from a principal that has an organization.
//!
//! ```ignore
//! let scoped = ScopedAccessor::new(store, &principal)?;
//! let patient = scoped.select::<Patient>().by_id("42").one().await?;
//! scoped.update::<ClinicalNote>().by_id(&note_id).set(json!({"status": "signed"})).await?;
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{ClinicError, ClinicResult};
use crate::lock::ensure_editable;
use crate::store::{
    from_row, to_row, Filter, StoreTransaction, TenantOwned, TenantStore, ID_COLUMN,
    ORGANIZATION_COLUMN,
};
use crate::tenant::{OrganizationId, Principal, TenantContext};

enum Exec<'a, S: TenantStore> {
    Auto(&'a S),
    Tx(&'a mut S::Tx),
}

// Runs `$body` against a transaction: the caller's open one, or a fresh one
// committed on success and rolled back (dropped) on error.
macro_rules! with_tx {
    ($exec:expr, $tx:ident => $body:expr) => {
        match $exec {
            Exec::Auto(store) => {
                let mut owned = store.begin().await?;
                let out = {
                    let $tx = &mut owned;
                    $body
                };
                owned.commit().await?;
                out
            }
            Exec::Tx($tx) => $body,
        }
    };
}

pub struct ScopedAccessor<S: TenantStore> {
    store: Arc<S>,
    tenant: TenantContext,
}

impl<S: TenantStore> Clone for ScopedAccessor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            tenant: self.tenant.clone(),
        }
    }
}

impl<S: TenantStore> ScopedAccessor<S> {
    /// Fails with `NoActiveTenant` when the principal has no organization.
    pub fn new(store: Arc<S>, principal: &Principal) -> ClinicResult<Self> {
        Ok(Self::for_tenant(store, principal.tenant()?))
    }

    pub fn for_tenant(store: Arc<S>, tenant: TenantContext) -> Self {
        Self { store, tenant }
    }

    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    pub fn organization_id(&self) -> &OrganizationId {
        self.tenant.organization_id()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn select<T: TenantOwned>(&self) -> Select<'_, S, T> {
        Select::new(Exec::Auto(self.store.as_ref()), self.organization_id().clone())
    }

    pub fn insert<T: TenantOwned>(&self) -> Insert<'_, S, T> {
        Insert::new(Exec::Auto(self.store.as_ref()), self.organization_id().clone())
    }

    pub fn update<T: TenantOwned>(&self) -> Update<'_, S, T> {
        Update::new(Exec::Auto(self.store.as_ref()), self.organization_id().clone())
    }

    pub fn delete<T: TenantOwned>(&self) -> Delete<'_, S, T> {
        Delete::new(Exec::Auto(self.store.as_ref()), self.organization_id().clone())
    }

    /// Open a transaction carrying the same scope. Nothing it does is visible
    /// until `commit`; dropping it rolls everything back.
    pub async fn begin(&self) -> ClinicResult<ScopedTransaction<S>> {
        Ok(ScopedTransaction {
            tx: self.store.begin().await?,
            tenant: self.tenant.clone(),
        })
    }
}

pub struct ScopedTransaction<S: TenantStore> {
    tx: S::Tx,
    tenant: TenantContext,
}

impl<S: TenantStore> ScopedTransaction<S> {
    pub fn tenant(&self) -> &TenantContext {
        &self.tenant
    }

    pub fn select<T: TenantOwned>(&mut self) -> Select<'_, S, T> {
        let org = self.tenant.organization_id().clone();
        Select::new(Exec::Tx(&mut self.tx), org)
    }

    pub fn insert<T: TenantOwned>(&mut self) -> Insert<'_, S, T> {
        let org = self.tenant.organization_id().clone();
        Insert::new(Exec::Tx(&mut self.tx), org)
    }

    pub fn update<T: TenantOwned>(&mut self) -> Update<'_, S, T> {
        let org = self.tenant.organization_id().clone();
        Update::new(Exec::Tx(&mut self.tx), org)
    }

    pub fn delete<T: TenantOwned>(&mut self) -> Delete<'_, S, T> {
        let org = self.tenant.organization_id().clone();
        Delete::new(Exec::Tx(&mut self.tx), org)
    }

    pub async fn commit(self) -> ClinicResult<()> {
        self.tx.commit().await
    }
}

// ──────────────────────────────────────────────────────────────
// Select
// ──────────────────────────────────────────────────────────────

pub struct Select<'a, S: TenantStore, T> {
    exec: Exec<'a, S>,
    filter: Filter,
    _entity: PhantomData<fn() -> T>,
}

impl<'a, S: TenantStore, T: TenantOwned> Select<'a, S, T> {
    fn new(exec: Exec<'a, S>, org: OrganizationId) -> Self {
        Self {
            exec,
            filter: Filter::for_organization(org),
            _entity: PhantomData,
        }
    }

    pub fn by_id(mut self, id: impl Into<String>) -> Self {
        self.filter = self.filter.eq(ID_COLUMN, Value::String(id.into()));
        self
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = self.filter.eq(column, value.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.filter = self.filter.limit(limit);
        self
    }

    pub async fn all(self) -> ClinicResult<Vec<T>> {
        let filter = self.filter;
        let rows = with_tx!(self.exec, tx => tx.select(T::TABLE, &filter).await?);
        rows.into_iter().map(from_row).collect()
    }

    pub async fn first(self) -> ClinicResult<Option<T>> {
        Ok(self.limit(1).all().await?.into_iter().next())
    }

    /// Exactly the matching row, or `NotFound`. A row owned by another
    /// organization is indistinguishable from a missing one.
    pub async fn one(self) -> ClinicResult<T> {
        self.first()
            .await?
            .ok_or_else(|| ClinicError::not_found(format!("{} not found", T::TABLE)).into_anyhow())
    }
}

// ──────────────────────────────────────────────────────────────
// Insert
// ──────────────────────────────────────────────────────────────

pub struct Insert<'a, S: TenantStore, T> {
    exec: Exec<'a, S>,
    organization_id: OrganizationId,
    _entity: PhantomData<fn() -> T>,
}

impl<'a, S: TenantStore, T: TenantOwned> Insert<'a, S, T> {
    fn new(exec: Exec<'a, S>, organization_id: OrganizationId) -> Self {
        Self {
            exec,
            organization_id,
            _entity: PhantomData,
        }
    }

    /// Insert `rows`, each stamped with the caller's organization.
    pub async fn values(self, rows: Vec<T>) -> ClinicResult<Vec<T>> {
        let mut stamped = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.set_organization_id(self.organization_id.clone());
            let mut value = to_row(T::TABLE, &row)?;
            // The serialized form wins over whatever the type reports.
            value[ORGANIZATION_COLUMN] = Value::String(self.organization_id.as_str().to_string());
            stamped.push(value);
        }
        debug!(table = T::TABLE, organization_id = %self.organization_id, rows = stamped.len(), "scoped insert");
        let inserted = with_tx!(self.exec, tx => tx.insert(T::TABLE, stamped).await?);
        inserted.into_iter().map(from_row).collect()
    }

    pub async fn value(self, row: T) -> ClinicResult<T> {
        self.values(vec![row])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ClinicError::general_error("Insert returned no row").into_anyhow())
    }
}

// ──────────────────────────────────────────────────────────────
// Update
// ──────────────────────────────────────────────────────────────

pub struct Update<'a, S: TenantStore, T> {
    exec: Exec<'a, S>,
    filter: Filter,
    _entity: PhantomData<fn() -> T>,
}

impl<'a, S: TenantStore, T: TenantOwned> Update<'a, S, T> {
    fn new(exec: Exec<'a, S>, org: OrganizationId) -> Self {
        Self {
            exec,
            filter: Filter::for_organization(org),
            _entity: PhantomData,
        }
    }

    pub fn by_id(mut self, id: impl Into<String>) -> Self {
        self.filter = self.filter.eq(ID_COLUMN, Value::String(id.into()));
        self
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = self.filter.eq(column, value.into());
        self
    }

    /// Merge `patch` into every matching row and return the updated rows.
    ///
    /// `id` is never changed and `organization_id` is re-stamped with the
    /// caller's organization. If any matching row is locked, nothing is
    /// applied and the lock reason comes back as `Locked`.
    pub async fn set<V: Serialize>(self, patch: V) -> ClinicResult<Vec<T>> {
        let patch = scoped_patch(&patch, self.filter.organization_id())?;
        let filter = self.filter;
        let updated = with_tx!(self.exec, tx => apply_update::<_, T>(tx, &filter, &patch).await?);
        Ok(updated)
    }
}

fn scoped_patch<V: Serialize>(patch: &V, org: &OrganizationId) -> ClinicResult<Map<String, Value>> {
    let mut patch = match serde_json::to_value(patch) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            return Err(ClinicError::bad_request("Update payload must be an object").into_anyhow())
        }
        Err(e) => return Err(ClinicError::bad_request(e.to_string()).into_anyhow()),
    };
    patch.remove(ID_COLUMN);
    patch.insert(
        ORGANIZATION_COLUMN.to_string(),
        Value::String(org.as_str().to_string()),
    );
    Ok(patch)
}

// Every matched row must stay editable and still read back as `T` once
// patched; otherwise nothing reaches the store.
async fn apply_update<Tx, T>(
    tx: &mut Tx,
    filter: &Filter,
    patch: &Map<String, Value>,
) -> ClinicResult<Vec<T>>
where
    Tx: StoreTransaction,
    T: TenantOwned,
{
    for row in tx.select(T::TABLE, filter).await? {
        let entity: T = from_row(row.clone())?;
        ensure_editable(&entity.lock_status())?;
        patched::<T>(row, patch)?;
    }
    let updated = tx.update(T::TABLE, filter, patch).await?;
    updated.into_iter().map(from_row).collect()
}

fn patched<T: TenantOwned>(mut row: Value, patch: &Map<String, Value>) -> ClinicResult<T> {
    if let Value::Object(obj) = &mut row {
        for (column, value) in patch {
            obj.insert(column.clone(), value.clone());
        }
    }
    serde_json::from_value(row).map_err(|e| {
        ClinicError::bad_request(format!("Invalid update for {}", T::TABLE))
            .with_data(serde_json::json!({ "reason": e.to_string() }))
            .into_anyhow()
    })
}

async fn ensure_rows_editable<Tx, T>(tx: &mut Tx, filter: &Filter) -> ClinicResult<()>
where
    Tx: StoreTransaction,
    T: TenantOwned,
{
    for row in tx.select(T::TABLE, filter).await? {
        let entity: T = from_row(row)?;
        ensure_editable(&entity.lock_status())?;
    }
    Ok(())
}

// ──────────────────────────────────────────────────────────────
// Delete
// ──────────────────────────────────────────────────────────────

pub struct Delete<'a, S: TenantStore, T> {
    exec: Exec<'a, S>,
    filter: Filter,
    _entity: PhantomData<fn() -> T>,
}

impl<'a, S: TenantStore, T: TenantOwned> Delete<'a, S, T> {
    fn new(exec: Exec<'a, S>, org: OrganizationId) -> Self {
        Self {
            exec,
            filter: Filter::for_organization(org),
            _entity: PhantomData,
        }
    }

    pub fn by_id(mut self, id: impl Into<String>) -> Self {
        self.filter = self.filter.eq(ID_COLUMN, Value::String(id.into()));
        self
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = self.filter.eq(column, value.into());
        self
    }

    /// Remove the matching rows and return them. Locked rows abort the
    /// whole delete.
    pub async fn execute(self) -> ClinicResult<Vec<T>> {
        let filter = self.filter;
        let removed = with_tx!(self.exec, tx => {
            ensure_rows_editable::<_, T>(tx, &filter).await?;
            let rows = tx.delete(T::TABLE, &filter).await?;
            rows.into_iter().map(from_row).collect::<ClinicResult<Vec<T>>>()?
        });
        Ok(removed)
    }
}
