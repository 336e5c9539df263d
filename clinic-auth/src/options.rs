// Identity options and configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HMAC algorithms accepted for clinic tokens.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum JwtAlgorithm {
    /// HMAC using SHA-256
    #[default]
    HS256,
    /// HMAC using SHA-384
    HS384,
    /// HMAC using SHA-512
    HS512,
}

/// JWT verification and issuance settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwtOptions {
    /// JWT signing algorithm
    pub algorithm: JwtAlgorithm,
    /// Token issuer (iss claim)
    pub issuer: String,
    /// Token audience (aud claim)
    pub audience: Vec<String>,
    /// Access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_expires_in: Duration,
    /// Clock skew tolerated on `exp`
    #[serde(with = "humantime_serde", default = "default_leeway")]
    pub leeway: Duration,
    /// Signing secret
    pub secret: Option<String>,
    /// Claim carrying the user id
    #[serde(default = "default_subject_claim")]
    pub subject_claim: String,
    /// Claim carrying the current organization
    #[serde(default = "default_organization_claim")]
    pub organization_claim: String,
    /// Claim carrying the declared role
    #[serde(default = "default_role_claim")]
    pub role_claim: String,
}

fn default_leeway() -> Duration {
    Duration::from_secs(30)
}

fn default_subject_claim() -> String {
    "sub".to_string()
}

fn default_organization_claim() -> String {
    "org".to_string()
}

fn default_role_claim() -> String {
    "role".to_string()
}

impl Default for JwtOptions {
    fn default() -> Self {
        Self {
            algorithm: JwtAlgorithm::default(),
            issuer: "clinicrs-auth".to_string(),
            audience: vec!["clinicrs-api".to_string()],
            access_token_expires_in: Duration::from_secs(3600), // 1 hour
            leeway: default_leeway(),
            secret: None,
            subject_claim: default_subject_claim(),
            organization_claim: default_organization_claim(),
            role_claim: default_role_claim(),
        }
    }
}

impl JwtOptions {
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Validate JWT configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.issuer.is_empty() {
            return Err("JWT issuer cannot be empty".to_string());
        }

        if self.audience.is_empty() {
            return Err("JWT audience cannot be empty".to_string());
        }

        if self.secret.as_deref().map_or(true, str::is_empty) {
            return Err("HMAC algorithms require a secret".to_string());
        }

        if self.access_token_expires_in.as_secs() == 0 {
            return Err("Access token expiration must be greater than 0".to_string());
        }

        for (name, claim) in [
            ("subject", &self.subject_claim),
            ("organization", &self.organization_claim),
            ("role", &self.role_claim),
        ] {
            if claim.trim().is_empty() {
                return Err(format!("JWT {name} claim name cannot be empty"));
            }
        }

        Ok(())
    }
}
