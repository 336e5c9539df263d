//! Storage seams for tenant-owned rows.
//!
//! Backends see rows as JSON objects. Every read, update and delete they
//! receive carries a [`Filter`], and a `Filter` cannot be built without an
//! organization id.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::errors::{ClinicError, ClinicResult};
use crate::tenant::{canonical_id, OrganizationId};

/// Column every tenant-owned row carries.
pub const ORGANIZATION_COLUMN: &str = "organization_id";
pub const ID_COLUMN: &str = "id";
pub const STATUS_COLUMN: &str = "status";

/// Infrastructure failures raised by storage backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Row is not a JSON object in table {0}")]
    NotAnObject(String),

    #[error("Duplicate id {id} in table {table}")]
    DuplicateId { table: String, id: String },

    #[error("Write rejected by backend: {0}")]
    WriteFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for ClinicError {
    fn from(e: StoreError) -> Self {
        let kind_msg = e.to_string();
        match e {
            StoreError::DuplicateId { .. } => ClinicError::conflict(kind_msg),
            _ => ClinicError::general_error(kind_msg),
        }
    }
}

/// An entity that belongs to exactly one organization.
///
/// Only `TenantOwned` types can go through the scoped accessor, so a table
/// without an owning organization cannot be queried through it at all.
pub trait TenantOwned: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;

    fn id(&self) -> &str;

    fn organization_id(&self) -> &OrganizationId;

    fn set_organization_id(&mut self, organization_id: OrganizationId);

    /// Status consulted by the lock guard before update/delete. Types that
    /// never lock keep the default.
    fn lock_status(&self) -> Option<&str> {
        None
    }
}

/// Row selection, always scoped to one organization.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    organization_id: OrganizationId,
    conditions: Vec<(String, Value)>,
    limit: Option<usize>,
}

impl Filter {
    pub fn for_organization(organization_id: OrganizationId) -> Self {
        Self {
            organization_id,
            conditions: Vec::new(),
            limit: None,
        }
    }

    /// Adds `column = value`. Conditions on the organization column are
    /// ignored: the scope is fixed at construction.
    pub fn eq(mut self, column: impl Into<String>, value: Value) -> Self {
        let column = column.into();
        if column != ORGANIZATION_COLUMN {
            self.conditions.push((column, value));
        }
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn organization_id(&self) -> &OrganizationId {
        &self.organization_id
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    pub fn max_rows(&self) -> Option<usize> {
        self.limit
    }

    /// Whether `row` belongs to the organization and meets every condition.
    /// Ids are compared in canonical form.
    pub fn matches(&self, row: &Value) -> bool {
        let owned = row
            .get(ORGANIZATION_COLUMN)
            .map_or(false, |v| self.organization_id.matches(v));
        owned
            && self.conditions.iter().all(|(col, expected)| {
                let actual = row.get(col).unwrap_or(&Value::Null);
                match (canonical_id(actual), canonical_id(expected)) {
                    (Some(a), Some(b)) => a == b,
                    _ => actual == expected,
                }
            })
    }
}

/// A unit of work against a backend. Dropping it without `commit` discards
/// everything it did.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn select(&mut self, table: &str, filter: &Filter) -> ClinicResult<Vec<Value>>;

    async fn insert(&mut self, table: &str, rows: Vec<Value>) -> ClinicResult<Vec<Value>>;

    /// Merge `patch` into every matching row; returns the updated rows.
    async fn update(
        &mut self,
        table: &str,
        filter: &Filter,
        patch: &Map<String, Value>,
    ) -> ClinicResult<Vec<Value>>;

    /// Remove every matching row; returns the removed rows.
    async fn delete(&mut self, table: &str, filter: &Filter) -> ClinicResult<Vec<Value>>;

    async fn commit(self) -> ClinicResult<()>
    where
        Self: Sized;
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    type Tx: StoreTransaction;

    async fn begin(&self) -> ClinicResult<Self::Tx>;
}

/// Resolves the owner of a row without returning any of its data.
#[async_trait]
pub trait OwnershipLookup: Send + Sync {
    async fn owner_of(&self, table: &str, id: &str) -> ClinicResult<Option<OrganizationId>>;
}

pub(crate) fn to_row<T: Serialize>(table: &str, value: &T) -> ClinicResult<Value> {
    let row = serde_json::to_value(value)
        .map_err(|e| ClinicError::from(StoreError::Serialization(e.to_string())).into_anyhow())?;
    if !row.is_object() {
        return Err(ClinicError::from(StoreError::NotAnObject(table.to_string())).into_anyhow());
    }
    Ok(row)
}

pub(crate) fn from_row<T: DeserializeOwned>(row: Value) -> ClinicResult<T> {
    serde_json::from_value(row)
        .map_err(|e| ClinicError::from(StoreError::Serialization(e.to_string())).into_anyhow())
}
