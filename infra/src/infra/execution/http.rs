use super::{EngineReply, ExecutionEngine};
use anyhow::Result;
use async_trait::async_trait;
use livecell_base::error::LiveError;
use livecell_base::widget::{SessionId, WidgetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Serialize)]
struct UpdateValueBody<'a> {
    value: &'a str,
}

#[derive(Serialize)]
struct ExecuteCellBody<'a> {
    code: &'a str,
}

#[derive(Deserialize, Default)]
struct SessionStateBody {
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

/// JSON-over-HTTP client for the execution engine.
///
/// Routes, relative to the base url:
/// - `POST   /sessions/{sid}`
/// - `DELETE /sessions/{sid}`
/// - `GET    /sessions/{sid}/state`
/// - `PUT    /sessions/{sid}/widgets/{wid}` `{"value"}`
/// - `POST   /sessions/{sid}/cells/{cid}/execute` `{"code"}`
#[derive(Clone, Debug)]
pub struct HttpExecutionEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpExecutionEngine {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(LiveError::from)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn session_url(&self, session_id: &SessionId) -> String {
        format!("{}/sessions/{}", self.base_url, session_id)
    }

    async fn reply(resp: reqwest::Response) -> Result<EngineReply> {
        let reply = resp
            .error_for_status()
            .map_err(LiveError::from)?
            .json::<EngineReply>()
            .await
            .map_err(LiveError::from)?;
        Ok(reply)
    }
}

#[async_trait]
impl ExecutionEngine for HttpExecutionEngine {
    async fn update_widget_value(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        value: &str,
    ) -> Result<EngineReply> {
        let resp = self
            .client
            .put(format!("{}/widgets/{}", self.session_url(session_id), widget_id))
            .json(&UpdateValueBody { value })
            .send()
            .await
            .map_err(LiveError::from)?;
        Self::reply(resp).await
    }

    async fn execute_cell(
        &self,
        session_id: &SessionId,
        cell_id: &str,
        code: &str,
    ) -> Result<EngineReply> {
        let resp = self
            .client
            .post(format!(
                "{}/cells/{}/execute",
                self.session_url(session_id),
                cell_id
            ))
            .json(&ExecuteCellBody { code })
            .send()
            .await
            .map_err(LiveError::from)?;
        Self::reply(resp).await
    }

    async fn get_session_state(&self, session_id: &SessionId) -> Result<BTreeMap<String, String>> {
        let body = self
            .client
            .get(format!("{}/state", self.session_url(session_id)))
            .send()
            .await
            .map_err(LiveError::from)?
            .error_for_status()
            .map_err(LiveError::from)?
            .json::<SessionStateBody>()
            .await
            .map_err(LiveError::from)?;
        Ok(body.variables)
    }

    async fn start_session(&self, session_id: &SessionId) -> Result<()> {
        self.client
            .post(self.session_url(session_id))
            .send()
            .await
            .map_err(LiveError::from)?
            .error_for_status()
            .map_err(LiveError::from)?;
        Ok(())
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<()> {
        self.client
            .delete(self.session_url(session_id))
            .send()
            .await
            .map_err(LiveError::from)?
            .error_for_status()
            .map_err(LiveError::from)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{serve, MockEngineState};
    use super::*;
    use livecell_base::error::ErrorKind;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_round_trip_against_engine() {
        let state = Arc::new(MockEngineState::default());
        let url = serve(state.clone()).await;
        let engine = HttpExecutionEngine::new(&url, 2000).unwrap();
        let sid = SessionId::new("s1");

        engine.start_session(&sid).await.unwrap();
        assert_eq!(*state.sessions.lock().unwrap(), vec!["s1".to_string()]);

        let reply = engine
            .update_widget_value(&sid, &WidgetId::new("w1"), "6")
            .await
            .unwrap();
        assert_eq!(reply.outputs, vec!["{\"w1\": 6}".to_string(), "done".to_string()]);

        let vars = engine.get_session_state(&sid).await.unwrap();
        assert_eq!(vars.get("w1"), Some(&"6".to_string()));

        let reply = engine.execute_cell(&sid, "c1", "raise").await.unwrap();
        assert_eq!(reply.error.as_deref(), Some("ValueError"));

        engine.end_session(&sid).await.unwrap();
        assert!(state.sessions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_engine_failures_are_remote_unavailable() {
        let url = serve(Arc::new(MockEngineState::default())).await;
        let engine = HttpExecutionEngine::new(&url, 2000).unwrap();
        let err = engine
            .execute_cell(&SessionId::new("s1"), "c1", "boom")
            .await
            .unwrap_err();
        assert_eq!(LiveError::classify(&err), ErrorKind::RemoteUnavailable);

        // nothing listens on port 9 of localhost
        let engine = HttpExecutionEngine::new("http://127.0.0.1:9", 500).unwrap();
        let err = engine.start_session(&SessionId::new("s1")).await.unwrap_err();
        assert_eq!(LiveError::classify(&err), ErrorKind::RemoteUnavailable);
    }
}
