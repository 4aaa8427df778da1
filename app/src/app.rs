pub mod collaboration;
pub mod coordinator;
pub mod session;

use serde::Deserialize;

/// Coordinator settings (`COORDINATOR_` prefix).
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// committed versions kept per widget
    pub history_limit: usize,
    /// 0: locks never expire
    pub lock_ttl_sec: u64,
    /// idle time before a session is evicted
    pub session_ttl_sec: u64,
    pub broadcast_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            lock_ttl_sec: 300,
            session_ttl_sec: 3600,
            broadcast_capacity: 256,
        }
    }
}
