use super::registry::{ClientWidget, WidgetRegistry, WidgetStatus};
use super::scheduler::{Phase, UpdateScheduler};
use super::transport::CoordinatorApi;
use super::SchedulerConfig;
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use infra::infra::persistence::autosave::{AutoSaver, SnapshotSource};
use infra::infra::persistence::manager::PersistenceManager;
use infra::infra::persistence::PersistedWidget;
use livecell_base::constraint::normalize;
use livecell_base::error::{ErrorKind, LiveError};
use livecell_base::protocol::{
    BatchUpdateItem, BatchUpdateRequest, BatchUpdateResponse, CollaborationEvent,
    ExecutionOutput, HistoryEntry, RegisterWidgetRequest, UpdateOutcome, UpdateValueRequest,
};
use livecell_base::widget::{ClientId, SessionId, WidgetId, WidgetValue};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One client's view of a live session.
///
/// Value changes go through the scheduler: interaction input stays local
/// until the interaction ends, bursts of discrete edits are debounced,
/// programmatic changes commit at once. Commits for one widget are strictly
/// sequential; input arriving during a commit is sent right after it.
pub struct SessionClient {
    session_id: SessionId,
    client_id: ClientId,
    api: Arc<dyn CoordinatorApi>,
    registry: WidgetRegistry,
    scheduler: UpdateScheduler,
    persistence: Option<Arc<PersistenceManager>>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("session_id", &self.session_id)
            .field("client_id", &self.client_id)
            .field("api", &self.api)
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .field("persistence", &self.persistence)
            .finish()
    }
}

impl SessionClient {
    pub fn new(
        api: Arc<dyn CoordinatorApi>,
        session_id: SessionId,
        client_id: ClientId,
        config: SchedulerConfig,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Self {
        Self {
            session_id,
            client_id,
            api,
            registry: WidgetRegistry::new(),
            scheduler: UpdateScheduler::new(config),
            persistence,
        }
    }

    /// Start (or join) a session on the coordinator.
    pub async fn connect(
        api: Arc<dyn CoordinatorApi>,
        session_id: Option<SessionId>,
        client_id: ClientId,
        config: SchedulerConfig,
        persistence: Option<Arc<PersistenceManager>>,
    ) -> Result<Arc<Self>> {
        let timeout = config.request_timeout();
        let info = Self::deadline(timeout, api.start_session(session_id)).await?;
        tracing::info!(session_id = %info.session_id, client_id = %client_id, "joined session");
        Ok(Arc::new(Self::new(
            api,
            info.session_id,
            client_id,
            config,
            persistence,
        )))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn phase(&self, widget_id: &WidgetId) -> Phase {
        self.scheduler.phase(widget_id)
    }

    async fn deadline<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(LiveError::RemoteUnavailable(format!(
                "coordinator did not answer within {:?}",
                timeout
            ))
            .into()),
        }
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        Self::deadline(self.scheduler.config().request_timeout(), fut).await
    }

    fn registered(&self, widget_id: &WidgetId) -> Result<ClientWidget> {
        self.registry.get(widget_id).ok_or_else(|| {
            LiveError::NotFound(format!("widget {} is not registered", widget_id)).into()
        })
    }

    /// Register a widget. With client persistence configured, a stored
    /// value is offered as the initial value; the coordinator keeps its own
    /// value if it already has one.
    pub async fn register_widget(&self, mut req: RegisterWidgetRequest) -> Result<ClientWidget> {
        if let Some(persistence) = &self.persistence {
            match persistence.load(&self.session_id, &req.widget_id).await {
                Ok(Some(stored)) if stored.widget_type == req.widget_type => {
                    tracing::debug!(widget_id = %req.widget_id, version = stored.version, "initial value from local persistence");
                    req.value = Some(stored.value);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(widget_id = %req.widget_id, "local persistence unavailable: {:?}", e)
                }
            }
        }
        let record = self.call(self.api.register(&self.session_id, req)).await?;
        Ok(self.registry.upsert(record))
    }

    pub fn get_widget(&self, widget_id: &WidgetId) -> Option<ClientWidget> {
        self.registry.get(widget_id)
    }

    pub fn get_all_widgets(&self) -> Vec<ClientWidget> {
        self.registry.all()
    }

    /// Optimistic local change, never committed by itself. During an
    /// interaction it becomes the value committed at interaction end.
    pub fn update_value_immediate(&self, widget_id: &WidgetId, value: WidgetValue) -> Result<()> {
        self.registry.apply_local(widget_id, value.clone())?;
        if self.scheduler.phase(widget_id) == Phase::Interacting {
            self.scheduler.record_interaction(widget_id, value);
        }
        Ok(())
    }

    /// Continuous (drag) input during an interaction. Rendering is
    /// throttled; the latest value is always kept for the final commit.
    /// Returns whether the value was rendered.
    pub fn drag_value(&self, widget_id: &WidgetId, value: WidgetValue) -> Result<bool> {
        self.registered(widget_id)?;
        if self.scheduler.phase(widget_id) != Phase::Interacting {
            self.scheduler.start_interaction(widget_id);
        }
        let render = self.scheduler.record_interaction(widget_id, value.clone());
        if render {
            self.registry.apply_local(widget_id, value)?;
        }
        Ok(render)
    }

    /// Discrete input (typed characters): shown at once, committed after the
    /// debounce window unless superseded. Inside an interaction it waits for
    /// the interaction to end instead.
    pub fn update_value(self: &Arc<Self>, widget_id: &WidgetId, value: WidgetValue) -> Result<()> {
        self.registry.apply_local(widget_id, value.clone())?;
        if self.scheduler.phase(widget_id) == Phase::Interacting {
            self.scheduler.record_interaction(widget_id, value);
            return Ok(());
        }
        let generation = self.scheduler.arm_debounce(widget_id);
        let delay = self.scheduler.config().debounce();
        let this = Arc::downgrade(self);
        let wid = widget_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = this.upgrade() else {
                return;
            };
            if !this.scheduler.take_debounce(&wid, generation) {
                return;
            }
            if let Some(current) = this.registry.get(&wid) {
                // failures are already reflected on the widget status
                let _ = this.commit(&wid, current.value).await;
            }
        });
        self.scheduler.set_debounce(widget_id, generation, handle);
        Ok(())
    }

    /// Programmatic change: commits immediately when idle.
    pub async fn set_value(
        &self,
        widget_id: &WidgetId,
        value: WidgetValue,
    ) -> Result<Option<UpdateOutcome>> {
        if self.scheduler.phase(widget_id) == Phase::Interacting {
            self.update_value_immediate(widget_id, value)?;
            return Ok(None);
        }
        self.scheduler.cancel_debounce(widget_id);
        self.commit(widget_id, value).await
    }

    /// Commit the displayed value now, skipping any debounce wait.
    pub async fn commit_value(&self, widget_id: &WidgetId) -> Result<Option<UpdateOutcome>> {
        let widget = self.registered(widget_id)?;
        self.scheduler.cancel_debounce(widget_id);
        self.commit(widget_id, widget.value).await
    }

    pub fn start_interaction(&self, widget_id: &WidgetId) -> Result<()> {
        self.registered(widget_id)?;
        self.scheduler.start_interaction(widget_id);
        tracing::debug!(widget_id = %widget_id, "interaction started");
        Ok(())
    }

    /// End the interaction and commit its final value.
    pub async fn end_interaction(&self, widget_id: &WidgetId) -> Result<Option<UpdateOutcome>> {
        let widget = self.registered(widget_id)?;
        let value = self.scheduler.end_interaction(widget_id).unwrap_or(widget.value);
        tracing::debug!(widget_id = %widget_id, "interaction ended");
        self.commit(widget_id, value).await
    }

    /// Validate and send one value. `Ok(None)` when nothing was sent: the
    /// value matched the last commit, or it was queued behind a commit in
    /// flight.
    pub async fn commit(
        &self,
        widget_id: &WidgetId,
        value: WidgetValue,
    ) -> Result<Option<UpdateOutcome>> {
        let widget = self.registered(widget_id)?;
        let value = match normalize(&widget.constraints, &value) {
            Ok(v) => v,
            Err(violation) => {
                tracing::debug!(widget_id = %widget_id, reason = %violation.reason, "local value rejected");
                let err: anyhow::Error = LiveError::ValidationError(violation.reason).into();
                self.registry.fail(widget_id, WidgetStatus::from_error(&err));
                return Err(err);
            }
        };
        self.registry.apply_local(widget_id, value.clone())?;
        if value == widget.committed_value && !self.scheduler.in_flight(widget_id) {
            return Ok(None);
        }
        if !self.scheduler.begin_commit(widget_id, value.clone()) {
            tracing::debug!(widget_id = %widget_id, "commit in flight, value queued");
            return Ok(None);
        }
        self.registry.set_loading(widget_id, true);

        let mut next = value;
        let mut last = None;
        loop {
            let req = UpdateValueRequest::new(next).from_holder(self.client_id.clone());
            match self
                .call(self.api.update(&self.session_id, widget_id, req))
                .await
            {
                Ok(outcome) => {
                    let committed = outcome.value.clone();
                    self.registry
                        .apply_commit(&outcome, self.scheduler.has_pending_local(widget_id));
                    last = Some(outcome);
                    match self.next_to_send(widget_id, &committed) {
                        Some(v) => {
                            self.registry.set_loading(widget_id, true);
                            next = v;
                        }
                        None => break,
                    }
                }
                Err(e) => {
                    let dropped = self.scheduler.abort_commit(widget_id);
                    let status = WidgetStatus::from_error(&e);
                    if status.kind.is_user_resolvable() {
                        tracing::debug!(widget_id = %widget_id, kind = %status.kind, "commit rejected: {}", e);
                    } else {
                        tracing::warn!(widget_id = %widget_id, kind = %status.kind, "commit failed: {:?}", e);
                    }
                    if dropped.is_some() {
                        tracing::debug!(widget_id = %widget_id, "queued follow-up discarded");
                    }
                    self.registry.fail(widget_id, status);
                    return Err(e);
                }
            }
        }
        Ok(last)
    }

    /// Next queued value that differs from what was just committed; `None`
    /// releases the commit slot.
    fn next_to_send(&self, widget_id: &WidgetId, committed: &WidgetValue) -> Option<WidgetValue> {
        loop {
            match self.scheduler.next_follow_up(widget_id) {
                Some(v) if &v == committed => continue,
                other => return other,
            }
        }
    }

    pub async fn batch_update(&self, updates: Vec<BatchUpdateItem>) -> Result<BatchUpdateResponse> {
        let resp = self
            .call(self.api.batch(
                &self.session_id,
                BatchUpdateRequest {
                    updates,
                    holder_id: Some(self.client_id.clone()),
                },
            ))
            .await?;
        for id in &resp.succeeded {
            match self.call(self.api.state(&self.session_id, id)).await {
                Ok(record) => {
                    self.registry.upsert(record);
                }
                Err(e) => tracing::warn!(widget_id = %id, "refresh after batch failed: {:?}", e),
            }
        }
        Ok(resp)
    }

    pub async fn request_lock(&self, widget_id: &WidgetId) -> Result<bool> {
        let resp = self
            .call(self.api.lock(&self.session_id, widget_id, &self.client_id))
            .await?;
        self.registry.set_lock(widget_id, resp.lock);
        Ok(resp.acquired)
    }

    pub async fn release_lock(&self, widget_id: &WidgetId) -> Result<bool> {
        let released = self
            .call(self.api.unlock(&self.session_id, widget_id, &self.client_id))
            .await?;
        if released {
            self.registry.set_lock(widget_id, None);
        }
        Ok(released)
    }

    pub async fn history(&self, widget_id: &WidgetId, since: Option<u64>) -> Result<Vec<HistoryEntry>> {
        self.call(self.api.history(&self.session_id, widget_id, since))
            .await
    }

    pub async fn unregister_widget(&self, widget_id: &WidgetId) -> Result<bool> {
        self.scheduler.forget(widget_id);
        self.registry.remove(widget_id);
        self.call(self.api.unregister(&self.session_id, widget_id))
            .await
    }

    pub async fn execute_cell(&self, cell_id: &str, code: &str) -> Result<ExecutionOutput> {
        self.call(self.api.execute_cell(&self.session_id, cell_id, code))
            .await
    }

    /// Re-fetch every widget; used after missing collaboration events.
    pub async fn resync(&self) -> Result<usize> {
        let records = self.call(self.api.all_states(&self.session_id)).await?;
        let n = records.len();
        for record in records {
            if !self.scheduler.has_pending_local(&record.widget_id) {
                self.registry.upsert(record);
            }
        }
        Ok(n)
    }

    /// Apply one event from another observer.
    pub fn apply_event(&self, event: CollaborationEvent) {
        match event {
            CollaborationEvent::ValueCommitted {
                widget_id,
                value,
                version,
                updated_at,
                ..
            } => {
                let keep_display = self.scheduler.has_pending_local(&widget_id);
                if self
                    .registry
                    .apply_remote(&widget_id, value, version, updated_at, keep_display)
                {
                    tracing::debug!(widget_id = %widget_id, version, "remote commit applied");
                }
            }
            CollaborationEvent::LockChanged { widget_id, lock } => {
                self.registry.set_lock(&widget_id, lock);
            }
            CollaborationEvent::WidgetRemoved { widget_id } => {
                self.scheduler.forget(&widget_id);
                self.registry.remove(&widget_id);
            }
        }
    }

    /// Follow the session's collaboration events until it ends or this
    /// client is dropped.
    pub async fn listen(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut events = self
            .call(self.api.subscribe(&self.session_id, Some(self.client_id.clone())))
            .await?;
        let this: Weak<Self> = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(client) = this.upgrade() else {
                    break;
                };
                client.apply_event(event);
            }
            tracing::debug!("collaboration listener stopped");
        }))
    }

    /// Periodically snapshot committed values through `manager`.
    pub fn spawn_autosave(
        self: &Arc<Self>,
        manager: Arc<PersistenceManager>,
        interval: Duration,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let source: Arc<dyn SnapshotSource> = self.clone();
        Arc::new(AutoSaver::new(manager)).spawn(source, interval, shutdown_rx)
    }

    /// Leave the session: timers are cancelled and the local cache cleared.
    pub async fn close(&self, end_session: bool) -> Result<()> {
        self.scheduler.clear();
        self.registry.clear();
        if end_session {
            self.call(self.api.end_session(&self.session_id)).await?;
        }
        Ok(())
    }

    pub fn last_error(&self, widget_id: &WidgetId) -> Option<ErrorKind> {
        self.registry.get(widget_id)?.error.map(|e| e.kind)
    }
}

#[async_trait]
impl SnapshotSource for SessionClient {
    async fn snapshot(&self) -> Vec<PersistedWidget> {
        self.registry.snapshot(&self.session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::local::InProcessCoordinator;
    use app::module::test::new_for_test;
    use livecell_base::protocol::{LockResponse, SessionInfo};
    use livecell_base::widget::{WidgetProperties, WidgetRecord, WidgetType};

    async fn client() -> (Arc<SessionClient>, Arc<InProcessCoordinator>) {
        let module = new_for_test();
        let api = Arc::new(InProcessCoordinator::new(module.sessions.clone()));
        let client = SessionClient::connect(
            api.clone(),
            Some(SessionId::new("s1")),
            ClientId::new("c1"),
            SchedulerConfig::default(),
            None,
        )
        .await
        .unwrap();
        (client, api)
    }

    async fn slider(client: &SessionClient, id: &str) -> WidgetId {
        client
            .register_widget(RegisterWidgetRequest::new(
                id,
                WidgetType::Slider,
                Some(0.0.into()),
                WidgetProperties::bounded(0.0, 10.0, 2.0),
            ))
            .await
            .unwrap();
        WidgetId::new(id)
    }

    #[tokio::test]
    async fn test_interaction_commits_final_value_only() {
        let (client, api) = client().await;
        let w = slider(&client, "w1").await;
        client.start_interaction(&w).unwrap();
        for v in [2.0, 4.0, 6.0, 8.0] {
            client.drag_value(&w, v.into()).unwrap();
        }
        // nothing reached the coordinator yet
        let remote = api.state(client.session_id(), &w).await.unwrap();
        assert_eq!(remote.version, 0);

        let out = client.end_interaction(&w).await.unwrap().unwrap();
        assert_eq!(out.value, WidgetValue::Number(8.0));
        assert_eq!(out.version, 1);
        let local = client.get_widget(&w).unwrap();
        assert_eq!(local.value, WidgetValue::Number(8.0));
        assert_eq!(local.committed_value, WidgetValue::Number(8.0));
        assert_eq!(client.phase(&w), Phase::Idle);
    }

    #[tokio::test]
    async fn test_unchanged_value_is_not_sent() {
        let (client, _) = client().await;
        let w = slider(&client, "w1").await;
        assert!(client.set_value(&w, 0.0.into()).await.unwrap().is_none());
        // 1 snaps to 0 locally, still nothing to send
        assert!(client.set_value(&w, 1.0.into()).await.unwrap().is_none());
        assert_eq!(client.get_widget(&w).unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_debug_shows_identity() {
        let (client, _) = client().await;
        let shown = format!("{:?}", client);
        assert!(shown.contains("SessionClient"));
        assert!(shown.contains(client.client_id().as_str()));
    }

    #[tokio::test]
    async fn test_local_validation_blocks_commit() {
        let (client, api) = client().await;
        let w = slider(&client, "w1").await;
        let err = client
            .set_value(&w, WidgetValue::Text("x".to_string()))
            .await
            .unwrap_err();
        assert_eq!(LiveError::classify(&err), ErrorKind::ValidationError);
        assert_eq!(client.last_error(&w), Some(ErrorKind::ValidationError));
        assert_eq!(client.get_widget(&w).unwrap().value, WidgetValue::Number(0.0));
        assert_eq!(api.state(client.session_id(), &w).await.unwrap().version, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_burst() {
        let (client, api) = client().await;
        let w = slider(&client, "w1").await;
        for v in [2.0, 4.0, 6.0] {
            client.update_value(&w, v.into()).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(api.state(client.session_id(), &w).await.unwrap().version, 0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        let remote = api.state(client.session_id(), &w).await.unwrap();
        assert_eq!(remote.version, 1);
        assert_eq!(remote.value, WidgetValue::Number(6.0));
    }

    #[tokio::test]
    async fn test_lock_conflict_reverts_display() {
        let (client, api) = client().await;
        let w = slider(&client, "w1").await;
        let other = ClientId::new("other");
        let LockResponse { acquired, .. } = api.lock(client.session_id(), &w, &other).await.unwrap();
        assert!(acquired);
        assert!(!client.request_lock(&w).await.unwrap());

        let err = client.set_value(&w, 4.0.into()).await.unwrap_err();
        assert_eq!(LiveError::classify(&err), ErrorKind::LockConflict);
        let local = client.get_widget(&w).unwrap();
        assert_eq!(local.value, WidgetValue::Number(0.0));
        assert_eq!(local.error.unwrap().kind, ErrorKind::LockConflict);
    }

    #[tokio::test]
    async fn test_remote_commit_reaches_second_client() {
        let (one, api) = client().await;
        let w = slider(&one, "w1").await;
        let two = SessionClient::connect(
            api.clone(),
            Some(one.session_id().clone()),
            ClientId::new("c2"),
            SchedulerConfig::default(),
            None,
        )
        .await
        .unwrap();
        two.resync().await.unwrap();
        let listener = two.listen().await.unwrap();

        one.set_value(&w, 4.0.into()).await.unwrap();
        for _ in 0..50 {
            if two.get_widget(&w).map(|x| x.version) == Some(1) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(two.get_widget(&w).unwrap().value, WidgetValue::Number(4.0));
        listener.abort();
    }

    /// Holds every update until released, to observe in-flight behaviour.
    #[derive(Debug)]
    struct GatedApi {
        inner: InProcessCoordinator,
        gate: tokio::sync::Semaphore,
        sent: std::sync::Mutex<Vec<WidgetValue>>,
    }

    #[async_trait]
    impl CoordinatorApi for GatedApi {
        async fn start_session(&self, s: Option<SessionId>) -> Result<SessionInfo> {
            self.inner.start_session(s).await
        }
        async fn end_session(&self, s: &SessionId) -> Result<bool> {
            self.inner.end_session(s).await
        }
        async fn register(&self, s: &SessionId, r: RegisterWidgetRequest) -> Result<WidgetRecord> {
            self.inner.register(s, r).await
        }
        async fn update(&self, s: &SessionId, w: &WidgetId, r: UpdateValueRequest) -> Result<UpdateOutcome> {
            self.sent.lock().unwrap().push(r.value.clone());
            let _permit = self.gate.acquire().await?;
            self.inner.update(s, w, r).await
        }
        async fn batch(&self, s: &SessionId, r: BatchUpdateRequest) -> Result<BatchUpdateResponse> {
            self.inner.batch(s, r).await
        }
        async fn state(&self, s: &SessionId, w: &WidgetId) -> Result<WidgetRecord> {
            self.inner.state(s, w).await
        }
        async fn all_states(&self, s: &SessionId) -> Result<Vec<WidgetRecord>> {
            self.inner.all_states(s).await
        }
        async fn constraints(&self, s: &SessionId, w: &WidgetId) -> Result<livecell_base::constraint::ConstraintDescriptor> {
            self.inner.constraints(s, w).await
        }
        async fn history(&self, s: &SessionId, w: &WidgetId, since: Option<u64>) -> Result<Vec<HistoryEntry>> {
            self.inner.history(s, w, since).await
        }
        async fn lock(&self, s: &SessionId, w: &WidgetId, h: &ClientId) -> Result<LockResponse> {
            self.inner.lock(s, w, h).await
        }
        async fn unlock(&self, s: &SessionId, w: &WidgetId, h: &ClientId) -> Result<bool> {
            self.inner.unlock(s, w, h).await
        }
        async fn unregister(&self, s: &SessionId, w: &WidgetId) -> Result<bool> {
            self.inner.unregister(s, w).await
        }
        async fn subscribe(&self, s: &SessionId, o: Option<ClientId>) -> Result<futures::stream::BoxStream<'static, CollaborationEvent>> {
            self.inner.subscribe(s, o).await
        }
        async fn execute_cell(&self, s: &SessionId, c: &str, code: &str) -> Result<ExecutionOutput> {
            self.inner.execute_cell(s, c, code).await
        }
        async fn session_state(&self, s: &SessionId) -> Result<serde_json::Value> {
            self.inner.session_state(s).await
        }
    }

    #[tokio::test]
    async fn test_value_during_commit_is_sent_after_it() {
        let module = new_for_test();
        let api = Arc::new(GatedApi {
            inner: InProcessCoordinator::new(module.sessions.clone()),
            gate: tokio::sync::Semaphore::new(0),
            sent: std::sync::Mutex::new(vec![]),
        });
        let client = SessionClient::connect(
            api.clone(),
            None,
            ClientId::new("c1"),
            SchedulerConfig::default(),
            None,
        )
        .await
        .unwrap();
        let w = slider(&client, "w1").await;

        let first = {
            let client = client.clone();
            let w = w.clone();
            tokio::spawn(async move { client.set_value(&w, 2.0.into()).await })
        };
        while api.sent.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(client.phase(&w), Phase::Committing);
        // queued behind the commit in flight; the last one wins
        assert!(client.set_value(&w, 4.0.into()).await.unwrap().is_none());
        assert!(client.set_value(&w, 6.0.into()).await.unwrap().is_none());

        api.gate.add_permits(2);
        let out = first.await.unwrap().unwrap().unwrap();
        assert_eq!(out.value, WidgetValue::Number(6.0));
        assert_eq!(out.version, 2);
        assert_eq!(
            *api.sent.lock().unwrap(),
            vec![WidgetValue::Number(2.0), WidgetValue::Number(6.0)]
        );
        assert_eq!(client.phase(&w), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_is_remote_unavailable() {
        let module = new_for_test();
        let api = Arc::new(GatedApi {
            inner: InProcessCoordinator::new(module.sessions.clone()),
            gate: tokio::sync::Semaphore::new(0),
            sent: std::sync::Mutex::new(vec![]),
        });
        let client = SessionClient::connect(
            api,
            None,
            ClientId::new("c1"),
            SchedulerConfig {
                request_timeout_ms: 200,
                ..Default::default()
            },
            None,
        )
        .await
        .unwrap();
        let w = slider(&client, "w1").await;
        let err = client.set_value(&w, 4.0.into()).await.unwrap_err();
        assert_eq!(LiveError::classify(&err), ErrorKind::RemoteUnavailable);
        let local = client.get_widget(&w).unwrap();
        assert_eq!(local.value, WidgetValue::Number(0.0));
        assert!(!local.is_loading);
        // no automatic retry: the slot is free for the next attempt
        assert_eq!(client.phase(&w), Phase::Idle);
    }

    #[tokio::test]
    async fn test_registration_uses_local_persistence() {
        let module = new_for_test();
        let api = Arc::new(InProcessCoordinator::new(module.sessions.clone()));
        let persistence = Arc::new(PersistenceManager::ephemeral());
        persistence
            .save(&PersistedWidget {
                session_id: SessionId::new("s9"),
                widget_id: WidgetId::new("w1"),
                widget_type: WidgetType::Slider,
                value: WidgetValue::Number(4.0),
                properties: WidgetProperties::bounded(0.0, 10.0, 2.0),
                version: 0,
                last_updated: chrono::Utc::now(),
            })
            .await
            .unwrap();
        let client = SessionClient::connect(
            api,
            Some(SessionId::new("s9")),
            ClientId::new("c1"),
            SchedulerConfig::default(),
            Some(persistence.clone()),
        )
        .await
        .unwrap();
        let w = slider(&client, "w1").await;
        assert_eq!(client.get_widget(&w).unwrap().value, WidgetValue::Number(4.0));

        client.set_value(&w, 6.0.into()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let task = client.spawn_autosave(persistence.clone(), Duration::from_secs(3600), rx);
        tx.send(true).unwrap();
        task.await.unwrap();
        let saved = persistence
            .load(&SessionId::new("s9"), &w)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(saved.value, WidgetValue::Number(6.0));
    }
}
