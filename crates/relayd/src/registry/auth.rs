//! Token authentication for inbound connections.
//!
//! Peers present an HS256 (HMAC-SHA-256) JWT in a request header. The
//! `username` claim becomes the peer's [`Identity`]; `exp` is honoured when
//! present and can be made mandatory.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use relay_core::{Identity, TokenClaims};

use crate::config::AuthConfig;

/// Claims as they appear in the token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
}

/// Verifies tokens against one shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Creates a verifier for `secret`. With `require_exp`, tokens lacking
    /// an `exp` claim are rejected.
    pub fn new(secret: &str, require_exp: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = true;
        if require_exp {
            validation.set_required_spec_claims(&["exp"]);
        } else {
            validation.required_spec_claims.clear();
        }

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.secret, config.require_exp)
    }

    /// Verifies the signature and extracts the peer's identity.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let data = decode::<RawClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
                _ => AuthError::Malformed(e.to_string()),
            }
        })?;

        let username = data
            .claims
            .username
            .ok_or_else(|| AuthError::MissingClaim("username".to_string()))?;
        let identity =
            Identity::parse(username).map_err(|_| AuthError::MissingClaim("username".to_string()))?;

        Ok(TokenClaims::new(identity))
    }
}

/// Verifies `token` against `secret` with the default validation rules.
pub fn verify_token(token: &str, secret: &str) -> Result<TokenClaims, AuthError> {
    TokenVerifier::new(secret, false).verify(token)
}

/// Signs a token for `identity`, optionally expiring at `exp` (unix seconds).
///
/// Used by tooling and tests; production tokens come from the issuer that
/// shares the secret.
pub fn issue_token(identity: &str, secret: &str, exp: Option<u64>) -> Result<String, AuthError> {
    let claims = RawClaims {
        username: Some(identity.to_string()),
        exp,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Malformed(e.to_string()))
}

/// Extracts the token from a header value, accepting an optional `Bearer ` prefix.
///
/// Returns `None` for blank values.
pub fn extract_token(header_value: &str) -> Option<&str> {
    let value = header_value.trim();
    let token = match value.split_once(char::is_whitespace) {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        None if value.eq_ignore_ascii_case("bearer") => "",
        _ => value,
    };

    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Reasons a connection fails authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authentication token is not provided")]
    MissingToken,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token has expired")]
    Expired,

    #[error("token is missing the {0} claim")]
    MissingClaim(String),

    #[error("malformed token: {0}")]
    Malformed(String),
}
