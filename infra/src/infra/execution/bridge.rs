use super::{DisabledExecutionEngine, EngineReply, ExecutionEngine};
use anyhow::Result;
use livecell_base::codec::{UseValueCodec, ValueCodec};
use livecell_base::error::LiveError;
use livecell_base::protocol::ExecutionOutput;
use livecell_base::widget::{SessionId, WidgetId, WidgetType, WidgetValue};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Request/response client to the execution engine with a bounded deadline
/// on every call. An elapsed deadline is a `RemoteUnavailable` failure.
#[derive(Clone, Debug)]
pub struct ExecutionBridge {
    engine: Arc<dyn ExecutionEngine>,
    timeout: Duration,
}

impl ExecutionBridge {
    pub fn new(engine: Arc<dyn ExecutionEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(DisabledExecutionEngine), Duration::from_secs(5))
    }

    async fn with_deadline<T, F>(&self, op: &'static str, session_id: &SessionId, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let res = match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(LiveError::RemoteUnavailable(format!(
                "execution engine {} timed out after {:?}",
                op, self.timeout
            ))
            .into()),
        };
        if let Err(e) = &res {
            tracing::warn!(session_id = %session_id, op, "execution engine call failed: {:?}", e);
        }
        res
    }

    fn decode(reply: EngineReply) -> ExecutionOutput {
        ExecutionOutput {
            outputs: reply
                .outputs
                .iter()
                .map(|o| ValueCodec::decode_output(o))
                .collect(),
            error: reply.error,
        }
    }

    /// Forward a committed value; returns the engine's outputs.
    pub async fn forward_value(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        value: &WidgetValue,
    ) -> Result<ExecutionOutput> {
        let encoded = ValueCodec::encode_value(value)?;
        let reply = self
            .with_deadline(
                "update_widget_value",
                session_id,
                self.engine.update_widget_value(session_id, widget_id, &encoded),
            )
            .await?;
        tracing::debug!(
            session_id = %session_id,
            widget_id = %widget_id,
            outputs = reply.outputs.len(),
            "value forwarded to execution engine"
        );
        Ok(Self::decode(reply))
    }

    pub async fn execute_cell(
        &self,
        session_id: &SessionId,
        cell_id: &str,
        code: &str,
    ) -> Result<ExecutionOutput> {
        let reply = self
            .with_deadline(
                "execute_cell",
                session_id,
                self.engine.execute_cell(session_id, cell_id, code),
            )
            .await?;
        Ok(Self::decode(reply))
    }

    /// Session variables, decoded. A variable named after a widget in
    /// `widget_types` is read back as that widget's value; the others are
    /// JSON where they parse, text otherwise.
    pub async fn session_state(
        &self,
        session_id: &SessionId,
        widget_types: &HashMap<String, WidgetType>,
    ) -> Result<serde_json::Value> {
        let vars = self
            .with_deadline(
                "get_session_state",
                session_id,
                self.engine.get_session_state(session_id),
            )
            .await?;
        let mut decoded = serde_json::Map::with_capacity(vars.len());
        for (name, raw) in vars {
            let value = match widget_types.get(&name) {
                Some(widget_type) => ValueCodec::decode_value(*widget_type, &raw)
                    .and_then(|v| Ok(serde_json::to_value(v).map_err(LiveError::from)?))
                    .unwrap_or_else(|e| {
                        tracing::debug!(
                            session_id = %session_id,
                            variable = %name,
                            "variable doesn't decode as its widget value: {:?}",
                            e
                        );
                        ValueCodec::decode_output(&raw)
                    }),
                None => ValueCodec::decode_output(&raw),
            };
            decoded.insert(name, value);
        }
        Ok(serde_json::Value::Object(decoded))
    }

    pub async fn start_session(&self, session_id: &SessionId) -> Result<()> {
        self.with_deadline(
            "start_session",
            session_id,
            self.engine.start_session(session_id),
        )
        .await
    }

    pub async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        self.with_deadline("end_session", session_id, self.engine.end_session(session_id))
            .await
    }
}
