//! Configuration for the widget front server.

use std::time::Duration;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8011";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_addr: String,

    /// Deadline of a single coordinator call, in seconds
    pub timeout_sec: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            timeout_sec: 60,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("LIVE_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            timeout_sec: std::env::var("LIVE_REQUEST_TIMEOUT_SEC")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8011");
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
    }
}
