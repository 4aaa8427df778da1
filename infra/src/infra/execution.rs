pub mod bridge;
pub mod http;

use anyhow::Result;
use async_trait::async_trait;
use livecell_base::widget::{SessionId, WidgetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ExecutionConfig {
    /// base url of the execution engine; none disables forwarding
    pub url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 5000,
        }
    }
}

/// Raw engine reply. Outputs are strings; JSON payloads are decoded by the
/// bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineReply {
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Remote code-execution engine. Every value crossing this boundary is a
/// string.
#[async_trait]
pub trait ExecutionEngine: Send + Sync + std::fmt::Debug + 'static {
    async fn update_widget_value(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        value: &str,
    ) -> Result<EngineReply>;

    async fn execute_cell(
        &self,
        session_id: &SessionId,
        cell_id: &str,
        code: &str,
    ) -> Result<EngineReply>;

    /// Variables of the running session, by name.
    async fn get_session_state(&self, session_id: &SessionId) -> Result<BTreeMap<String, String>>;

    async fn start_session(&self, session_id: &SessionId) -> Result<()>;

    async fn end_session(&self, session_id: &SessionId) -> Result<()>;
}

/// Used when no engine is configured: accepts everything, produces nothing.
#[derive(Debug, Default, Clone)]
pub struct DisabledExecutionEngine;

#[async_trait]
impl ExecutionEngine for DisabledExecutionEngine {
    async fn update_widget_value(
        &self,
        _session_id: &SessionId,
        _widget_id: &WidgetId,
        _value: &str,
    ) -> Result<EngineReply> {
        Ok(EngineReply::default())
    }

    async fn execute_cell(
        &self,
        _session_id: &SessionId,
        _cell_id: &str,
        _code: &str,
    ) -> Result<EngineReply> {
        Ok(EngineReply::default())
    }

    async fn get_session_state(&self, _session_id: &SessionId) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn start_session(&self, _session_id: &SessionId) -> Result<()> {
        Ok(())
    }

    async fn end_session(&self, _session_id: &SessionId) -> Result<()> {
        Ok(())
    }
}

pub fn new_execution_engine(config: &ExecutionConfig) -> Result<Arc<dyn ExecutionEngine>> {
    match &config.url {
        Some(url) if !url.trim().is_empty() => {
            tracing::info!(url = %url, "execution engine configured");
            Ok(Arc::new(http::HttpExecutionEngine::new(url, config.timeout_ms)?))
        }
        _ => {
            tracing::info!("no execution engine configured, forwarding disabled");
            Ok(Arc::new(DisabledExecutionEngine))
        }
    }
}

pub trait UseExecutionBridge {
    fn execution_bridge(&self) -> &bridge::ExecutionBridge;
}
