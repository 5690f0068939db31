//! Settings type definitions.
//!
//! Every section implements [`Default`] with production values and is marked
//! `#[serde(default)]`, so a settings file only needs the keys it overrides.

mod auth;
mod bus;
mod server;

pub use auth::*;
pub use bus::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type for the relay.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "bus": { "url": "redis://cache:6379" },
///   "auth": { "mode": "jwt", "jwt_secret": "change-me" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// HTTP / WebSocket listener and connection limits.
    pub server: ServerSettings,
    /// Upstream publish/subscribe bus.
    pub bus: BusSettings,
    /// Identity verification on connect.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.send_queue_capacity must be at least 1".into(),
            ));
        }
        if self.bus.user_namespace.is_empty() || self.bus.user_namespace.contains(':') {
            return Err(SettingsError::InvalidValue(format!(
                "bus.user_namespace must be non-empty and contain no ':' (got {:?})",
                self.bus.user_namespace
            )));
        }
        if self.auth.mode == AuthMode::Jwt
            && self.auth.jwt_secret.as_deref().is_none_or(str::is_empty)
        {
            return Err(SettingsError::InvalidValue(
                "auth.mode = \"jwt\" requires auth.jwt_secret".into(),
            ));
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit one JSON object per line instead of the compact text format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let settings: RelaySettings =
            serde_json::from_str(r#"{"server":{"port":9000}}"#).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.bus.url, "redis://localhost:6379");
    }

    #[test]
    fn empty_object_is_default() {
        let settings: RelaySettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.server.port, RelaySettings::default().server.port);
        assert!(!settings.logging.json);
    }

    #[test]
    fn jwt_without_secret_is_invalid() {
        let mut settings = RelaySettings::default();
        settings.auth.mode = AuthMode::Jwt;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
        settings.auth.jwt_secret = Some(String::new());
        assert!(settings.validate().is_err());
        settings.auth.jwt_secret = Some("s3cret".into());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_heartbeat_is_invalid() {
        let mut settings = RelaySettings::default();
        settings.server.heartbeat_interval_secs = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat_interval_secs"));
    }

    #[test]
    fn namespace_with_colon_is_invalid() {
        let mut settings = RelaySettings::default();
        settings.bus.user_namespace = "user:notifications".into();
        assert!(settings.validate().is_err());
        settings.bus.user_namespace = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn zero_send_queue_is_invalid() {
        let mut settings = RelaySettings::default();
        settings.server.send_queue_capacity = 0;
        assert!(settings.validate().is_err());
    }
}
