// Identity context: bearer credential -> Principal.

use async_trait::async_trait;
use chrono::Utc;
use clinic_core::{canonical_id, ClinicResult, DeclaredRole, OrganizationId, Principal, UserId};
use http::header::AUTHORIZATION;
use http::HeaderMap;
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::errors::IdentityError;
use crate::jwt::{default_provider, JwtProvider};
use crate::options::JwtOptions;

/// Schemes accepted in the `Authorization` header.
pub const BEARER_SCHEMES: [&str; 2] = ["Bearer", "JWT"];

/// Pull the token out of `Authorization: <scheme> <token>`.
///
/// Missing, blank or malformed headers and unknown schemes are all
/// `NotAuthenticated`.
pub fn extract_bearer_token(headers: &HeaderMap) -> ClinicResult<String> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| IdentityError::MissingToken.into_anyhow())?;

    let (scheme, token) = raw
        .split_once(' ')
        .ok_or_else(|| IdentityError::MissingToken.into_anyhow())?;
    let token = token.trim();
    if token.is_empty() {
        return Err(IdentityError::MissingToken.into_anyhow());
    }
    if !BEARER_SCHEMES.iter().any(|s| s.eq_ignore_ascii_case(scheme.trim())) {
        return Err(IdentityError::UnsupportedScheme(scheme.trim().to_string()).into_anyhow());
    }
    Ok(token.to_string())
}

/// Resolves the authenticated principal of a request.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, headers: &HeaderMap) -> ClinicResult<Principal>;
}

/// Identity from signed JWTs.
pub struct JwtIdentityResolver {
    options: JwtOptions,
    provider: Box<dyn JwtProvider>,
}

impl JwtIdentityResolver {
    pub fn new(options: JwtOptions) -> Self {
        Self {
            options,
            provider: default_provider(),
        }
    }

    pub fn with_provider(options: JwtOptions, provider: Box<dyn JwtProvider>) -> Self {
        Self { options, provider }
    }

    pub fn options(&self) -> &JwtOptions {
        &self.options
    }

    /// Verify `token` and map its claims.
    pub fn principal_from_token(&self, token: &str) -> ClinicResult<Principal> {
        let claims = self.provider.verify(&self.options, token)?;
        principal_from_claims(&self.options, &claims)
    }

    /// Sign an access token for `user`, optionally bound to an organization
    /// and a declared role.
    pub fn issue(
        &self,
        user: &UserId,
        organization: Option<&OrganizationId>,
        role: Option<&str>,
    ) -> ClinicResult<String> {
        let now = Utc::now().timestamp();
        let exp = now + self.options.access_token_expires_in.as_secs() as i64;

        let mut claims = Map::new();
        claims.insert(self.options.subject_claim.clone(), json!(user.as_str()));
        if let Some(org) = organization {
            claims.insert(self.options.organization_claim.clone(), json!(org.as_str()));
        }
        if let Some(role) = role {
            claims.insert(self.options.role_claim.clone(), json!(role));
        }
        claims.insert("iss".to_string(), json!(self.options.issuer));
        claims.insert("aud".to_string(), json!(self.options.audience));
        claims.insert("iat".to_string(), json!(now));
        claims.insert("exp".to_string(), json!(exp));
        claims.insert("jti".to_string(), json!(Uuid::new_v4().to_string()));

        self.provider.sign(&self.options, &claims)
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    async fn resolve(&self, headers: &HeaderMap) -> ClinicResult<Principal> {
        let token = extract_bearer_token(headers)?;
        let principal = self.principal_from_token(&token)?;
        debug!(
            user_id = %principal.user_id,
            organization_id = ?principal.organization_id.as_ref().map(OrganizationId::as_str),
            "principal resolved"
        );
        Ok(principal)
    }
}

/// Map verified claims to a principal.
///
/// The subject is required. A missing or blank organization claim yields a
/// principal without a tenant; it authenticates but cannot reach tenant data.
pub fn principal_from_claims(options: &JwtOptions, claims: &Value) -> ClinicResult<Principal> {
    let user = claims
        .get(&options.subject_claim)
        .and_then(canonical_id)
        .ok_or_else(|| IdentityError::MissingSubject.into_anyhow())?;
    let organization = claims
        .get(&options.organization_claim)
        .and_then(OrganizationId::from_value);
    let role = DeclaredRole::parse(claims.get(&options.role_claim).and_then(Value::as_str));

    Ok(Principal::new(UserId::new(user), organization, role))
}
