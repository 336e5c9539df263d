//! Lock/status guard.
//!
//! Records in a terminal status (a signed clinical note, a voided invoice)
//! are frozen. Changes go through an addendum or amendment instead.
//! Everything here is pure.

use serde_json::Value;

use crate::errors::{ClinicError, ClinicResult};
use crate::store::STATUS_COLUMN;

/// Statuses after which a record can no longer be edited.
pub const TERMINAL_STATUSES: [&str; 4] = ["signed", "locked", "void", "canceled"];

/// Anything that may carry a workflow status.
pub trait StatusBearing {
    fn status(&self) -> Option<&str>;
}

impl StatusBearing for Value {
    fn status(&self) -> Option<&str> {
        self.get(STATUS_COLUMN).and_then(Value::as_str)
    }
}

impl StatusBearing for Option<&str> {
    fn status(&self) -> Option<&str> {
        *self
    }
}

impl StatusBearing for str {
    fn status(&self) -> Option<&str> {
        Some(self)
    }
}

fn terminal_status(status: Option<&str>) -> Option<&'static str> {
    let status = status?.trim();
    TERMINAL_STATUSES
        .into_iter()
        .find(|t| t.eq_ignore_ascii_case(status))
}

/// Rows without a status are editable.
pub fn can_edit<E: StatusBearing + ?Sized>(entity: &E) -> bool {
    terminal_status(entity.status()).is_none()
}

/// Human-readable reason an entity is frozen, `None` when editable.
pub fn get_lock_reason<E: StatusBearing + ?Sized>(entity: &E) -> Option<String> {
    terminal_status(entity.status()).map(|status| {
        format!(
            "This record is {status} and can no longer be edited. Add an addendum or request an amendment instead."
        )
    })
}

/// `Locked` with the lock reason when the entity is frozen.
pub fn ensure_editable<E: StatusBearing + ?Sized>(entity: &E) -> ClinicResult<()> {
    match get_lock_reason(entity) {
        None => Ok(()),
        Some(reason) => Err(ClinicError::locked(reason).into_anyhow()),
    }
}
