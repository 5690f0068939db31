//! Identity verification settings.

use serde::{Deserialize, Serialize};

/// How a connecting client's identity is established.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Trust the `user_id` query parameter as-is.
    #[default]
    None,
    /// Require an HS256 JWT in the `token` query parameter; identity is `sub`.
    Jwt,
}

/// Identity verification settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Verification mode.
    pub mode: AuthMode,
    /// Shared HMAC secret for [`AuthMode::Jwt`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
}
