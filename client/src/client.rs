pub mod registry;
pub mod scheduler;
pub mod session;
pub mod transport;

use anyhow::Result;
use livecell_base::error::LiveError;
use livecell_base::{DEFAULT_DEBOUNCE_MS, DEFAULT_THROTTLE_MS};
use serde::Deserialize;
use std::time::Duration;

/// Timing of the client update pipeline (`SCHEDULER_` prefix).
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SchedulerConfig {
    /// quiet period before a burst of discrete edits is committed
    pub debounce_ms: u64,
    /// minimum interval between optimistic renders while dragging
    pub throttle_ms: u64,
    /// deadline of every call to the coordinator
    pub request_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            throttle_ms: DEFAULT_THROTTLE_MS,
            request_timeout_ms: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

pub fn load_scheduler_config_from_env() -> Result<SchedulerConfig> {
    envy::prefixed("SCHEDULER_")
        .from_env::<SchedulerConfig>()
        .map_err(|e| LiveError::RuntimeError(format!("cannot read scheduler config from env: {:?}", e)).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_defaults() {
        let c = SchedulerConfig::default();
        assert_eq!(c.debounce(), Duration::from_millis(300));
        assert_eq!(c.throttle(), Duration::from_millis(100));
        assert_eq!(c.request_timeout(), Duration::from_secs(10));
    }
}
