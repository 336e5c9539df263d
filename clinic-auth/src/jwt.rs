// JWT signing and verification backends.

use anyhow::Result;
use serde_json::{Map, Value};

use crate::errors::IdentityError;
use crate::options::JwtOptions;

pub trait JwtProvider: Send + Sync {
    fn sign(&self, jwt: &JwtOptions, claims: &Map<String, Value>) -> Result<String>;

    /// Verify signature, issuer, audience and expiry; return the claims.
    fn verify(&self, jwt: &JwtOptions, token: &str) -> Result<Value>;
}

/// The provider compiled in by the selected crypto feature.
pub fn default_provider() -> Box<dyn JwtProvider> {
    #[cfg(any(feature = "jwt-aws-lc-rs", feature = "jwt-rust-crypto"))]
    {
        Box::new(JsonwebtokenProvider)
    }
    #[cfg(not(any(feature = "jwt-aws-lc-rs", feature = "jwt-rust-crypto")))]
    {
        Box::new(NoJwtProvider)
    }
}

#[cfg(not(any(feature = "jwt-aws-lc-rs", feature = "jwt-rust-crypto")))]
struct NoJwtProvider;

#[cfg(not(any(feature = "jwt-aws-lc-rs", feature = "jwt-rust-crypto")))]
impl JwtProvider for NoJwtProvider {
    fn sign(&self, _jwt: &JwtOptions, _claims: &Map<String, Value>) -> Result<String> {
        Err(IdentityError::Disabled.into_anyhow())
    }

    fn verify(&self, _jwt: &JwtOptions, _token: &str) -> Result<Value> {
        Err(IdentityError::Disabled.into_anyhow())
    }
}

#[cfg(any(feature = "jwt-aws-lc-rs", feature = "jwt-rust-crypto"))]
pub struct JsonwebtokenProvider;

#[cfg(any(feature = "jwt-aws-lc-rs", feature = "jwt-rust-crypto"))]
impl JsonwebtokenProvider {
    fn algorithm(alg: crate::options::JwtAlgorithm) -> jsonwebtoken::Algorithm {
        use crate::options::JwtAlgorithm;
        match alg {
            JwtAlgorithm::HS256 => jsonwebtoken::Algorithm::HS256,
            JwtAlgorithm::HS384 => jsonwebtoken::Algorithm::HS384,
            JwtAlgorithm::HS512 => jsonwebtoken::Algorithm::HS512,
        }
    }

    fn secret(jwt: &JwtOptions) -> Result<&[u8]> {
        jwt.secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(str::as_bytes)
            .ok_or_else(|| IdentityError::MissingSecret.into_anyhow())
    }
}

#[cfg(any(feature = "jwt-aws-lc-rs", feature = "jwt-rust-crypto"))]
impl JwtProvider for JsonwebtokenProvider {
    fn sign(&self, jwt: &JwtOptions, claims: &Map<String, Value>) -> Result<String> {
        use jsonwebtoken::{encode, EncodingKey, Header};

        let header = Header::new(Self::algorithm(jwt.algorithm));
        encode(&header, claims, &EncodingKey::from_secret(Self::secret(jwt)?))
            .map_err(|e| IdentityError::Signing(e.to_string()).into_anyhow())
    }

    fn verify(&self, jwt: &JwtOptions, token: &str) -> Result<Value> {
        use jsonwebtoken::{decode, DecodingKey, Validation};

        let mut validation = Validation::new(Self::algorithm(jwt.algorithm));
        validation.set_issuer(&[jwt.issuer.as_str()]);
        validation.set_audience(&jwt.audience.iter().map(|s| s.as_str()).collect::<Vec<_>>());
        validation.leeway = jwt.leeway.as_secs();

        let decoded = decode::<Value>(
            token,
            &DecodingKey::from_secret(Self::secret(jwt)?),
            &validation,
        )
        .map_err(|e| IdentityError::InvalidToken(e.to_string()).into_anyhow())?;

        Ok(decoded.claims)
    }
}
