pub mod execution;
pub mod persistence;
pub mod resource;

use self::execution::ExecutionConfig;
use self::persistence::PersistenceConfig;
use self::resource::{load_execution_config_from_env, load_persistence_config_from_env};
use std::sync::Arc;

/// Infrastructure settings read once at startup.
#[derive(Clone, Debug)]
pub struct InfraConfigModule {
    pub persistence_config: Arc<PersistenceConfig>,
    pub execution_config: Arc<ExecutionConfig>,
}

impl InfraConfigModule {
    pub fn new_by_env() -> Self {
        Self {
            persistence_config: Arc::new(load_persistence_config_from_env().unwrap_or_else(|e| {
                tracing::warn!("use default persistence config: {:?}", e);
                PersistenceConfig::default()
            })),
            execution_config: Arc::new(load_execution_config_from_env().unwrap_or_else(|e| {
                tracing::warn!("use default execution config: {:?}", e);
                ExecutionConfig::default()
            })),
        }
    }
}

// using from other test
#[cfg(any(test, feature = "test-utils"))]
pub mod test {
    use super::execution::ExecutionConfig;
    use super::persistence::{PersistenceConfig, PersistenceKind};
    use super::InfraConfigModule;
    use once_cell::sync::Lazy;
    use std::sync::Arc;

    pub static EPHEMERAL_CONFIG: Lazy<PersistenceConfig> = Lazy::new(|| PersistenceConfig {
        kind: PersistenceKind::Ephemeral,
        cache_ttl_sec: 60,
        ..Default::default()
    });

    pub static SQLITE_MEMORY_CONFIG: Lazy<PersistenceConfig> = Lazy::new(|| PersistenceConfig {
        kind: PersistenceKind::Local,
        sqlite_url: "sqlite::memory:".to_string(),
        cache_ttl_sec: 60,
        ..Default::default()
    });

    pub static REDIS_CONFIG: Lazy<PersistenceConfig> = Lazy::new(|| PersistenceConfig {
        kind: PersistenceKind::Remote,
        redis_url: std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
        redis_ttl_sec: 60,
        cache_ttl_sec: 60,
        ..Default::default()
    });

    pub fn new_for_test_config() -> InfraConfigModule {
        InfraConfigModule {
            persistence_config: Arc::new(EPHEMERAL_CONFIG.clone()),
            execution_config: Arc::new(ExecutionConfig::default()),
        }
    }
}
