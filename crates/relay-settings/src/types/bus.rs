//! Upstream pub/sub bus settings.

use serde::{Deserialize, Serialize};

/// Which bus implementation the relay subscribes through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Redis `PSUBSCRIBE` / `PUBLISH`.
    #[default]
    Redis,
    /// In-process bus; only useful for development and tests.
    Memory,
}

/// Bus connection and channel-naming settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Bus implementation.
    pub kind: BusKind,
    /// Transport URL (ignored by the memory bus).
    pub url: String,
    /// Pattern whose messages go to every connection.
    pub broadcast_pattern: String,
    /// Namespace of targeted channels (`<namespace>:<identity>`).
    pub user_namespace: String,
    /// Reconnect backoff step in milliseconds.
    pub backoff_unit_ms: u64,
    /// Reconnect backoff ceiling in milliseconds.
    pub backoff_cap_ms: u64,
}

impl BusSettings {
    /// The wildcard pattern covering every targeted channel.
    pub fn user_pattern(&self) -> String {
        format!("{}:*", self.user_namespace)
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            kind: BusKind::Redis,
            url: "redis://localhost:6379".to_string(),
            broadcast_pattern: "notifications".to_string(),
            user_namespace: "user-notifications".to_string(),
            backoff_unit_ms: 50,
            backoff_cap_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_pattern_appends_wildcard() {
        let cfg = BusSettings::default();
        assert_eq!(cfg.user_pattern(), "user-notifications:*");
    }

    #[test]
    fn kind_parses_lowercase() {
        let kind: BusKind = serde_json::from_str(r#""memory""#).unwrap();
        assert_eq!(kind, BusKind::Memory);
        assert!(serde_json::from_str::<BusKind>(r#""Kafka""#).is_err());
    }

    #[test]
    fn backoff_defaults() {
        let cfg = BusSettings::default();
        assert_eq!(cfg.backoff_unit_ms, 50);
        assert_eq!(cfg.backoff_cap_ms, 2000);
    }
}
