use axum::extract::FromRequestParts;
use axum::http::header::USER_AGENT;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use clinic_core::{AccessEvent, AuditEvent, Principal};

use crate::state::{ClinicBackend, ClinicState};
use crate::ClinicAxumError;

/// Client details recorded on audit and access entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    /// The first `x-forwarded-for` hop, else `x-real-ip`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let ip = header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| header("x-real-ip"))
            .map(str::to_string);
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Self { ip, user_agent }
    }

    pub fn stamp_audit(&self, event: AuditEvent) -> AuditEvent {
        event.with_ip(self.ip.clone())
    }

    pub fn stamp_access(&self, event: AccessEvent) -> AccessEvent {
        event.with_client(self.ip.clone(), self.user_agent.clone())
    }
}

/// The authenticated caller of a request.
///
/// Reuses the principal a permission gate already resolved; otherwise the
/// bearer credential is verified here. Fails with `NotAuthenticated`.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub principal: Principal,
    pub meta: RequestMeta,
}

impl Authenticated {
    pub async fn resolve<S: ClinicBackend>(
        headers: &HeaderMap,
        state: &ClinicState<S>,
    ) -> Result<Self, ClinicAxumError> {
        let principal = state.identity.resolve(headers).await?;
        Ok(Self {
            principal,
            meta: RequestMeta::from_headers(headers),
        })
    }
}

impl<S: ClinicBackend> FromRequestParts<ClinicState<S>> for Authenticated {
    type Rejection = ClinicAxumError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ClinicState<S>,
    ) -> Result<Self, Self::Rejection> {
        if let Some(auth) = parts.extensions.get::<Authenticated>() {
            return Ok(auth.clone());
        }
        let auth = Self::resolve(&parts.headers, state).await?;
        parts.extensions.insert(auth.clone());
        Ok(auth)
    }
}
