//! Engine configuration types for Waypoint.
//!
//! `EngineConfig` represents the top-level `config.toml` read from the data
//! directory. All fields have defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine and the `wpt` driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Width to which step messages are truncated when an action fails.
    #[serde(default = "default_max_field_length")]
    pub max_field_length: usize,

    /// Seconds between two passes of the periodic driver.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Age in days after which finished instances are pruned.
    #[serde(default = "default_history_days")]
    pub history_days: u32,

    /// Overrides the SQLite database location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// When false, actions declared detached run inline instead.
    #[serde(default = "default_detached_actions")]
    pub detached_actions: bool,
}

fn default_max_field_length() -> usize {
    128
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_history_days() -> u32 {
    30
}

fn default_detached_actions() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_field_length: default_max_field_length(),
            tick_interval_secs: default_tick_interval_secs(),
            history_days: default_history_days(),
            database_url: None,
            detached_actions: default_detached_actions(),
        }
    }
}
