//! # relay-settings
//!
//! Configuration for the fan-out relay, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: a JSON file deep-merged over the defaults
//! 3. **Environment variables**: `PORT`, `REDIS_URL`, `RELAY_*` (highest priority)
//!
//! The binary applies CLI flags on top of the loaded value. There is no
//! global instance: the composition root owns the settings and hands the
//! relevant sections to each component.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
