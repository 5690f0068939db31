//! Identity verification at connect time.
//!
//! The relay routes on an opaque identity string. By default that string is
//! taken from the `user_id` query parameter without any check
//! ([`QueryIdentityVerifier`]); deployments that need real authentication
//! configure [`JwtVerifier`], which reads an HS256 token from `token` and
//! uses its `sub` claim.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use relay_settings::{AuthMode, AuthSettings};
use serde::Deserialize;
use thiserror::Error;

use crate::errors::ServerError;
use crate::websocket::connection::ANONYMOUS;

/// Query parameters of the WebSocket upgrade request.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Caller-supplied identity.
    pub user_id: Option<String>,
    /// Credential, only read by verifying implementations.
    pub token: Option<String>,
}

/// Why a connection was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    /// No credential was supplied.
    #[error("missing token")]
    MissingToken,
    /// The credential failed verification.
    #[error("invalid token: {0}")]
    InvalidToken(String),
}

/// Resolves the identity of a connecting client.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Return the identity to register the connection under.
    async fn verify(&self, params: &ConnectParams) -> Result<String, AuthRejection>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Trusts `user_id` as given; missing or empty becomes `"anonymous"`.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryIdentityVerifier;

#[async_trait]
impl IdentityVerifier for QueryIdentityVerifier {
    async fn verify(&self, params: &ConnectParams) -> Result<String, AuthRejection> {
        Ok(params
            .user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(ANONYMOUS)
            .to_owned())
    }

    fn name(&self) -> &'static str {
        "query"
    }
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies an HS256 JWT and takes the identity from `sub`.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for tokens signed with `secret`.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["sub"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, params: &ConnectParams) -> Result<String, AuthRejection> {
        let token = params
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or(AuthRejection::MissingToken)?;
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthRejection::InvalidToken(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(AuthRejection::InvalidToken("empty subject".into()));
        }
        Ok(data.claims.sub)
    }

    fn name(&self) -> &'static str {
        "jwt"
    }
}

/// Build the verifier selected by `settings.mode`.
pub fn verifier_from_settings(
    settings: &AuthSettings,
) -> Result<Arc<dyn IdentityVerifier>, ServerError> {
    match settings.mode {
        AuthMode::None => Ok(Arc::new(QueryIdentityVerifier)),
        AuthMode::Jwt => {
            let secret = settings
                .jwt_secret
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ServerError::Config("jwt auth requires a secret".into()))?;
            Ok(Arc::new(JwtVerifier::new(secret)))
        }
    }
}
