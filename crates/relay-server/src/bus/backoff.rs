//! Reconnect delay schedule for the bus transport.

use std::time::Duration;

use relay_settings::BusSettings;

/// Capped-linear backoff: `min(attempt * unit, cap)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectBackoff {
    unit: Duration,
    cap: Duration,
}

impl ReconnectBackoff {
    /// Create a schedule from a step and a ceiling.
    pub fn new(unit: Duration, cap: Duration) -> Self {
        Self { unit, cap }
    }

    /// Build from bus settings.
    pub fn from_settings(settings: &BusSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.backoff_unit_ms),
            Duration::from_millis(settings.backoff_cap_ms),
        )
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt).min(self.cap)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from_settings(&BusSettings::default())
    }
}
