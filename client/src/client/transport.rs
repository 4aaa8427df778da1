pub mod http;
pub mod local;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use livecell_base::constraint::ConstraintDescriptor;
use livecell_base::protocol::{
    BatchUpdateRequest, BatchUpdateResponse, CollaborationEvent, ExecutionOutput, HistoryEntry,
    LockResponse, RegisterWidgetRequest, SessionInfo, UpdateOutcome, UpdateValueRequest,
};
use livecell_base::widget::{ClientId, SessionId, WidgetId, WidgetRecord};

/// Calls a client can make against the session coordinator.
#[async_trait]
pub trait CoordinatorApi: Send + Sync + std::fmt::Debug + 'static {
    async fn start_session(&self, session_id: Option<SessionId>) -> Result<SessionInfo>;

    async fn end_session(&self, session_id: &SessionId) -> Result<bool>;

    async fn register(
        &self,
        session_id: &SessionId,
        req: RegisterWidgetRequest,
    ) -> Result<WidgetRecord>;

    async fn update(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        req: UpdateValueRequest,
    ) -> Result<UpdateOutcome>;

    async fn batch(
        &self,
        session_id: &SessionId,
        req: BatchUpdateRequest,
    ) -> Result<BatchUpdateResponse>;

    async fn state(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<WidgetRecord>;

    async fn all_states(&self, session_id: &SessionId) -> Result<Vec<WidgetRecord>>;

    async fn constraints(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
    ) -> Result<ConstraintDescriptor>;

    async fn history(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        since: Option<u64>,
    ) -> Result<Vec<HistoryEntry>>;

    async fn lock(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        holder_id: &ClientId,
    ) -> Result<LockResponse>;

    async fn unlock(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
        holder_id: &ClientId,
    ) -> Result<bool>;

    async fn unregister(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<bool>;

    /// Collaboration events of the session, without the observer's own
    /// commits. Ends when the session does.
    async fn subscribe(
        &self,
        session_id: &SessionId,
        observer: Option<ClientId>,
    ) -> Result<BoxStream<'static, CollaborationEvent>>;

    async fn execute_cell(
        &self,
        session_id: &SessionId,
        cell_id: &str,
        code: &str,
    ) -> Result<ExecutionOutput>;

    async fn session_state(&self, session_id: &SessionId) -> Result<serde_json::Value>;
}
