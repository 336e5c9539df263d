//! clinic-axum: route-boundary integration for ClinicRS.
//!
//! Resolves the caller, enforces `module:action` gates and turns
//! `ClinicError`s into HTTP responses.

pub mod app;
pub mod extract;
pub mod middleware;
pub mod state;
mod error;

pub use app::with_request_tracing;
pub use error::{ClinicAxumError, INTERNAL_ERROR_MESSAGE};
pub use extract::{Authenticated, RequestMeta};
pub use middleware::require_permission;
pub use state::{ClinicBackend, ClinicState, PermissionGate};

pub use axum;
