use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clinic_core::{ClinicError, ErrorKind};
use tracing::error;

/// Body message of every `GeneralError` response.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug)]
pub struct ClinicAxumError(pub anyhow::Error);

impl From<anyhow::Error> for ClinicAxumError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ClinicAxumError {
    fn into_response(self) -> Response {
        // A ClinicError anywhere in the chain keeps its kind and fields.
        // Internal failures only reach the log.
        let safe = match ClinicError::from_anyhow(&self.0) {
            Some(clinic) if clinic.kind != ErrorKind::GeneralError => clinic.sanitize_for_client(),
            _ => ClinicError::general_error(INTERNAL_ERROR_MESSAGE),
        };
        let status = StatusCode::from_u16(safe.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = ?self.0, "request failed");
        }
        (status, Json(safe.to_json())).into_response()
    }
}
