// Identity failures.

use clinic_core::ClinicError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("No access token")]
    MissingToken,

    #[error("Unsupported authorization scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Invalid access token: {0}")]
    InvalidToken(String),

    #[error("Access token has no subject")]
    MissingSubject,

    #[error("JWT secret is not configured")]
    MissingSecret,

    #[error("JWT support is disabled (enable one of: jwt-aws-lc-rs, jwt-rust-crypto)")]
    Disabled,

    #[error("Could not sign token: {0}")]
    Signing(String),
}

impl From<IdentityError> for ClinicError {
    fn from(e: IdentityError) -> Self {
        let msg = e.to_string();
        match e {
            IdentityError::MissingSecret | IdentityError::Disabled | IdentityError::Signing(_) => {
                ClinicError::general_error(msg)
            }
            _ => ClinicError::not_authenticated(msg),
        }
    }
}

impl IdentityError {
    pub fn into_anyhow(self) -> anyhow::Error {
        ClinicError::from(self).into_anyhow()
    }
}
