use crate::app::session::SessionRegistry;
use crate::app::CoordinatorConfig;
use anyhow::Result;
use infra::infra::execution::bridge::ExecutionBridge;
use infra::infra::execution::{new_execution_engine, UseExecutionBridge};
use infra::infra::persistence::manager::PersistenceManager;
use infra::infra::persistence::UsePersistenceManager;
use infra::infra::InfraConfigModule;
use std::sync::Arc;
use std::time::Duration;

pub fn load_coordinator_config() -> CoordinatorConfig {
    envy::prefixed("COORDINATOR_")
        .from_env::<CoordinatorConfig>()
        .unwrap_or_else(|e| {
            tracing::warn!("use default coordinator config: {:?}", e);
            CoordinatorConfig::default()
        })
}

#[derive(Clone, Debug)]
pub struct AppConfigModule {
    pub coordinator_config: Arc<CoordinatorConfig>,
    pub infra_config: InfraConfigModule,
}

impl AppConfigModule {
    pub fn new_by_env() -> Self {
        Self {
            coordinator_config: Arc::new(load_coordinator_config()),
            infra_config: InfraConfigModule::new_by_env(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppModule {
    pub config_module: Arc<AppConfigModule>,
    pub persistence: Arc<PersistenceManager>,
    pub bridge: Arc<ExecutionBridge>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppModule {
    pub fn new(
        config_module: Arc<AppConfigModule>,
        persistence: Arc<PersistenceManager>,
        bridge: Arc<ExecutionBridge>,
    ) -> Self {
        let sessions = Arc::new(SessionRegistry::new(
            persistence.clone(),
            bridge.clone(),
            config_module.coordinator_config.clone(),
        ));
        Self {
            config_module,
            persistence,
            bridge,
            sessions,
        }
    }

    pub async fn new_by_env(config_module: Arc<AppConfigModule>) -> Result<Self> {
        let infra_config = &config_module.infra_config;
        let persistence =
            Arc::new(PersistenceManager::new(&infra_config.persistence_config).await?);
        let execution_config = &infra_config.execution_config;
        let bridge = Arc::new(ExecutionBridge::new(
            new_execution_engine(execution_config)?,
            Duration::from_millis(execution_config.timeout_ms),
        ));
        let module = Self::new(config_module, persistence, bridge);
        module.sessions.start_cleanup_task();
        Ok(module)
    }
}

impl UsePersistenceManager for AppModule {
    fn persistence_manager(&self) -> &PersistenceManager {
        &self.persistence
    }
}

impl UseExecutionBridge for AppModule {
    fn execution_bridge(&self) -> &ExecutionBridge {
        &self.bridge
    }
}

// using from other test
#[cfg(any(test, feature = "test-utils"))]
pub mod test {
    use super::{AppConfigModule, AppModule};
    use crate::app::CoordinatorConfig;
    use infra::infra::execution::bridge::ExecutionBridge;
    use infra::infra::persistence::manager::PersistenceManager;
    use std::sync::Arc;

    pub fn new_for_test_config(coordinator_config: CoordinatorConfig) -> AppConfigModule {
        AppConfigModule {
            coordinator_config: Arc::new(coordinator_config),
            infra_config: infra::infra::test::new_for_test_config(),
        }
    }

    /// Ephemeral persistence, no execution engine.
    pub fn new_for_test() -> AppModule {
        new_for_test_with(CoordinatorConfig::default())
    }

    pub fn new_for_test_with(coordinator_config: CoordinatorConfig) -> AppModule {
        AppModule::new(
            Arc::new(new_for_test_config(coordinator_config)),
            Arc::new(PersistenceManager::ephemeral()),
            Arc::new(ExecutionBridge::disabled()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infra::infra::persistence::PersistenceKind;

    #[tokio::test]
    async fn test_module_from_test_config() {
        let module = AppModule::new_by_env(Arc::new(test::new_for_test_config(
            CoordinatorConfig::default(),
        )))
        .await
        .unwrap();
        assert_eq!(module.persistence_manager().kind(), PersistenceKind::Ephemeral);
        let session = module.sessions.start_session(None).await.unwrap();
        assert!(module.sessions.get(session.session_id()).is_ok());
        assert_eq!(
            module
                .execution_bridge()
                .session_state(session.session_id(), &Default::default())
                .await
                .unwrap(),
            serde_json::json!({})
        );
    }
}
