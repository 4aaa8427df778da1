//! Widget front HTTP server binary.
//!
//! Starts a session coordinator configured from the environment and serves
//! it over HTTP until ctrl-c.
//!
//! # Environment Variables
//!
//! - `LIVE_ADDR`: HTTP server bind address (default: 127.0.0.1:8011)
//! - `LIVE_REQUEST_TIMEOUT_SEC`: Deadline of each coordinator call (default: 60)
//! - `PERSISTENCE_KIND`: `ephemeral`, `local` (SQLite) or `remote` (Redis)
//! - `EXECUTION_URL`: execution engine endpoint; unset disables forwarding
//! - `COORDINATOR_SESSION_TTL_SEC`, `COORDINATOR_LOCK_TTL_SEC`,
//!   `COORDINATOR_HISTORY_LIMIT`: coordinator tuning

use anyhow::Result;
use app::module::{AppConfigModule, AppModule};
use dotenvy::dotenv;
use infra::infra::persistence::UsePersistenceManager;
use std::sync::Arc;
use widget_front::logging::tracing_init;
use widget_front::{boot_widget_server, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_init()?;

    tracing::info!("starting {}", livecell_base::APP_FRONT_NAME);

    let app_config_module = Arc::new(AppConfigModule::new_by_env());
    let app_module = AppModule::new_by_env(app_config_module).await?;

    let server_config = ServerConfig::from_env();
    tracing::info!(
        "widget front configuration: bind_addr={}, timeout={}s, persistence={:?}",
        server_config.bind_addr,
        server_config.timeout_sec,
        app_module.persistence_manager().kind()
    );

    boot_widget_server(app_module.sessions.clone(), server_config, None).await
}
