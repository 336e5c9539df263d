// Identity context for ClinicRS: bearer credentials in, principals out.

pub mod errors;
pub mod identity;
pub mod jwt;
pub mod options;

pub use errors::IdentityError;
pub use identity::{
    extract_bearer_token, principal_from_claims, IdentityResolver, JwtIdentityResolver,
    BEARER_SCHEMES,
};
pub use jwt::{default_provider, JwtProvider};
pub use options::{JwtAlgorithm, JwtOptions};
