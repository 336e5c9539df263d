//! # Errors
//!
//! ClinicRS carries structured, status-coded errors through `anyhow::Error`
//! so that every layer (guard, resolver, accessor) can use `?` and the route
//! boundary can still recover the exact kind.
//!
//! - consistent status codes + class names
//! - can be carried through anyhow::Error
//! - transport-agnostic (the axum adapter decides how to serialize)

use std::fmt;

use anyhow::Error as AnyError;
use serde_json::Value;

/// A convenience result type for ClinicRS core APIs.
pub type ClinicResult<T> = std::result::Result<T, AnyError>;

/// Error class names + status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadRequest,         // 400
    NotAuthenticated,   // 401
    NoActiveTenant,     // 403
    Forbidden,          // 403
    NotFound,           // 404
    Conflict,           // 409
    Unprocessable,      // 422
    Locked,             // 423
    GeneralError,       // 500
    Unavailable,        // 503
}

impl ErrorKind {
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::NotAuthenticated => 401,
            ErrorKind::NoActiveTenant => 403,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Unprocessable => 422,
            ErrorKind::Locked => 423,
            ErrorKind::GeneralError => 500,
            ErrorKind::Unavailable => 503,
        }
    }

    /// Error `name` (e.g. "NotFound")
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::NotAuthenticated => "NotAuthenticated",
            ErrorKind::NoActiveTenant => "NoActiveTenant",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Unprocessable => "Unprocessable",
            ErrorKind::Locked => "Locked",
            ErrorKind::GeneralError => "GeneralError",
            ErrorKind::Unavailable => "Unavailable",
        }
    }

    /// Error `className` (kebab-cased)
    pub fn class_name(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::NotAuthenticated => "not-authenticated",
            ErrorKind::NoActiveTenant => "no-active-tenant",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unprocessable => "unprocessable",
            ErrorKind::Locked => "locked",
            ErrorKind::GeneralError => "general-error",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

/// A structured ClinicRS error that can live inside `anyhow::Error`.
///
/// Fields:
/// - kind (drives name / code / class_name)
/// - message
/// - data (optional)
/// - errors (optional)
/// - source (never sent to clients)
#[derive(Debug)]
pub struct ClinicError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<Value>,
    pub errors: Option<Value>,
    pub source: Option<AnyError>,
}

impl ClinicError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
            errors: None,
            source: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_errors(mut self, errors: Value) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn with_source(mut self, source: AnyError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn class_name(&self) -> &'static str {
        self.kind.class_name()
    }

    /// Convert into `anyhow::Error` so it flows through `?`.
    pub fn into_anyhow(self) -> AnyError {
        AnyError::new(self)
    }

    /// Find a `ClinicError` anywhere in an `anyhow::Error` chain.
    pub fn from_anyhow(err: &AnyError) -> Option<&ClinicError> {
        err.chain().find_map(|e| e.downcast_ref::<ClinicError>())
    }

    /// Kind of the first `ClinicError` in the chain, if any.
    pub fn kind_of(err: &AnyError) -> Option<ErrorKind> {
        Self::from_anyhow(err).map(|e| e.kind)
    }

    /// Turn any error into a ClinicError:
    /// - if it's already a ClinicError, keep it (lossless)
    /// - otherwise wrap as GeneralError
    pub fn normalize(err: AnyError) -> ClinicError {
        match err.downcast::<ClinicError>() {
            Ok(clinic) => clinic,
            Err(other) => {
                if let Some(inner) = Self::from_anyhow(&other) {
                    return inner.sanitize_for_client();
                }
                ClinicError::new(ErrorKind::GeneralError, other.to_string()).with_source(other)
            }
        }
    }

    /// A "safe" copy suitable for returning to clients: the inner `source`
    /// (stack/secret details) is dropped.
    pub fn sanitize_for_client(&self) -> ClinicError {
        ClinicError {
            kind: self.kind,
            message: self.message.clone(),
            data: self.data.clone(),
            errors: self.errors.clone(),
            source: None,
        }
    }

    pub fn to_json(&self) -> Value {
        use serde_json::json;

        let mut base = json!({
            "name": self.name(),
            "message": self.message,
            "code": self.code(),
            "className": self.class_name(),
        });

        if let Some(d) = &self.data {
            base["data"] = d.clone();
        }
        if let Some(e) = &self.errors {
            base["errors"] = e.clone();
        }
        base
    }

    // ---- Constructors ----

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, msg)
    }
    pub fn not_authenticated(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAuthenticated, msg)
    }
    pub fn no_active_tenant(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoActiveTenant, msg)
    }
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, msg)
    }
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, msg)
    }
    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unprocessable, msg)
    }
    pub fn locked(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Locked, msg)
    }
    pub fn general_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::GeneralError, msg)
    }
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, msg)
    }
}

impl fmt::Display for ClinicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.name(), self.code(), self.message)
    }
}

impl std::error::Error for ClinicError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience helper for "bail with ClinicError".
#[macro_export]
macro_rules! bail_clinic {
    ($ctor:ident, $msg:expr) => {
        return Err($crate::errors::ClinicError::$ctor($msg).into_anyhow())
    };
    ($ctor:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::errors::ClinicError::$ctor(format!($fmt, $($arg)*)).into_anyhow())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kinds_map_to_expected_status_codes() {
        assert_eq!(ErrorKind::NotAuthenticated.status_code(), 401);
        assert_eq!(ErrorKind::NoActiveTenant.status_code(), 403);
        assert_eq!(ErrorKind::Forbidden.status_code(), 403);
        assert_eq!(ErrorKind::NotFound.status_code(), 404);
        assert_eq!(ErrorKind::Locked.status_code(), 423);
    }

    #[test]
    fn kind_survives_anyhow_context() {
        let err: AnyError = ClinicError::forbidden("Requires clinical.sign").into_anyhow();
        let err = Err::<(), _>(err).context("while signing note").unwrap_err();
        assert_eq!(ClinicError::kind_of(&err), Some(ErrorKind::Forbidden));
    }

    #[test]
    fn normalize_wraps_foreign_errors_as_general() {
        let err = ClinicError::normalize(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.kind, ErrorKind::GeneralError);
        assert!(err.source.is_some());
        assert!(err.sanitize_for_client().source.is_none());
    }

    #[test]
    fn json_payload_has_name_code_and_class() {
        let json = ClinicError::no_active_tenant("No active organization").to_json();
        assert_eq!(json["name"], "NoActiveTenant");
        assert_eq!(json["code"], 403);
        assert_eq!(json["className"], "no-active-tenant");
    }

    fn bails() -> ClinicResult<()> {
        bail_clinic!(conflict, "request {} already processed", "c-1");
    }

    #[test]
    fn bail_macro_formats_message() {
        let err = bails().unwrap_err();
        let clinic = ClinicError::from_anyhow(&err).unwrap();
        assert_eq!(clinic.kind, ErrorKind::Conflict);
        assert_eq!(clinic.message, "request c-1 already processed");
    }
}
