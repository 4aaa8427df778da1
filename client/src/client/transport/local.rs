use super::CoordinatorApi;
use anyhow::Result;
use app::app::session::SessionRegistry;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use livecell_base::constraint::ConstraintDescriptor;
use livecell_base::protocol::{
    BatchUpdateRequest, BatchUpdateResponse, CollaborationEvent, ExecutionOutput, HistoryEntry,
    LockResponse, RegisterWidgetRequest, SessionInfo, UpdateOutcome, UpdateValueRequest,
};
use livecell_base::widget::{ClientId, SessionId, WidgetId, WidgetRecord};
use std::sync::Arc;

/// Direct calls into a coordinator living in the same process.
#[derive(Clone, Debug)]
pub struct InProcessCoordinator {
    sessions: Arc<SessionRegistry>,
}

impl InProcessCoordinator {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl CoordinatorApi for InProcessCoordinator {
    async fn start_session(&self, session_id: Option<SessionId>) -> Result<SessionInfo> {
        Ok(self.sessions.start_session(session_id).await?.info())
    }

    async fn end_session(&self, session_id: &SessionId) -> Result<bool> {
        self.sessions.end_session(session_id).await
    }

    async fn register(
        &self,
        session_id: &SessionId,
        req: RegisterWidgetRequest,
    ) -> Result<WidgetRecord> {
        self.sessions.get(session_id)?.register_widget(req).await
    }

    async fn update(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        req: UpdateValueRequest,
    ) -> Result<UpdateOutcome> {
        self.sessions.get(session_id)?.update_value(widget_id, req).await
    }

    async fn batch(
        &self,
        session_id: &SessionId,
        req: BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse> {
        Ok(self
            .sessions
            .get(session_id)?
            .batch_update(req.updates, req.holder_id)
            .await)
    }

    async fn state(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<WidgetRecord> {
        self.sessions.get(session_id)?.get_state(widget_id).await
    }

    async fn all_states(&self, session_id: &SessionId) -> Result<Vec<WidgetRecord>> {
        Ok(self.sessions.get(session_id)?.get_all().await)
    }

    async fn constraints(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
    ) -> Result<ConstraintDescriptor> {
        self.sessions.get(session_id)?.get_constraints(widget_id).await
    }

    async fn history(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        since: Option<u64>,
    ) -> Result<Vec<HistoryEntry>> {
        self.sessions.get(session_id)?.history(widget_id, since).await
    }

    async fn lock(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        holder_id: &ClientId,
    ) -> Result<LockResponse> {
        let session = self.sessions.get(session_id)?;
        let acquired = session.request_lock(widget_id, holder_id)?;
        Ok(LockResponse {
            widget_id: widget_id.clone(),
            acquired,
            lock: session.get_state(widget_id).await?.lock,
        })
    }

    async fn unlock(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        holder_id: &ClientId,
    ) -> Result<bool> {
        self.sessions.get(session_id)?.release_lock(widget_id, holder_id)
    }

    async fn unregister(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<bool> {
        self.sessions.get(session_id)?.unregister(widget_id).await
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
        observer: Option<ClientId>,
    ) -> Result<BoxStream<'static, CollaborationEvent>> {
        Ok(self
            .sessions
            .get(session_id)?
            .subscribe(observer)
            .into_stream()
            .boxed())
    }

    async fn execute_cell(
        &self,
        session_id: &SessionId,
        cell_id: &str,
        code: &str,
    ) -> Result<ExecutionOutput> {
        self.sessions.get(session_id)?.execute_cell(cell_id, code).await
    }

    async fn session_state(&self, session_id: &SessionId) -> Result<serde_json::Value> {
        self.sessions.get(session_id)?.engine_state().await
    }
}
