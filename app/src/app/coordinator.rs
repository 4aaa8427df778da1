//! Authoritative per-session widget store.
//!
//! Every write to one widget goes through that widget's write lane (an async
//! mutex) so version increments, persistence and forwarding can't race.
//! Different widgets proceed independently. Readers take the record
//! snapshot and never wait for a write lane.
//!
//! Writes run on their own task: a caller that gives up waiting (deadline,
//! dropped connection) does not cut a write between persisting and
//! publishing.

use super::collaboration::{CollaborationHub, Observer};
use super::CoordinatorConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use infra::infra::execution::bridge::ExecutionBridge;
use infra::infra::persistence::manager::PersistenceManager;
use infra::infra::persistence::PersistedWidget;
use itertools::Itertools;
use livecell_base::constraint::{derive_constraints, normalize, ConstraintDescriptor};
use livecell_base::error::LiveError;
use livecell_base::protocol::{
    BatchFailure, BatchUpdateItem, BatchUpdateResponse, CollaborationEvent, ExecutionOutput,
    HistoryEntry, RegisterMode, RegisterWidgetRequest, SessionInfo, UpdateOutcome,
    UpdateValueRequest,
};
use livecell_base::widget::{
    ClientId, SessionId, WidgetId, WidgetRecord, WidgetType, WidgetValue,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug)]
struct WidgetSlot {
    write_lane: Mutex<()>,
    record: RwLock<WidgetRecord>,
    history: RwLock<VecDeque<HistoryEntry>>,
}

impl WidgetSlot {
    fn new(record: WidgetRecord) -> Self {
        Self {
            write_lane: Mutex::new(()),
            record: RwLock::new(record),
            history: RwLock::new(VecDeque::new()),
        }
    }
}

#[derive(Debug)]
pub struct SessionCoordinator {
    session_id: SessionId,
    created_at: DateTime<Utc>,
    last_active_ms: AtomicI64,
    widgets: DashMap<WidgetId, Arc<WidgetSlot>>,
    hub: CollaborationHub,
    persistence: Arc<PersistenceManager>,
    bridge: Arc<ExecutionBridge>,
    config: Arc<CoordinatorConfig>,
}

/// Attempts at finding a free version when the store is ahead of the live
/// record.
const PERSIST_ATTEMPTS: usize = 3;

/// Run a write to completion on its own task.
async fn detached<T, F>(write: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(write)
        .await
        .map_err(|e| LiveError::RuntimeError(format!("widget write task failed: {}", e)))?
}

fn validation_error(widget_id: &WidgetId, reason: String) -> LiveError {
    tracing::debug!(widget_id = %widget_id, reason = %reason, "value rejected");
    LiveError::ValidationError(reason)
}

impl SessionCoordinator {
    pub fn new(
        session_id: SessionId,
        persistence: Arc<PersistenceManager>,
        bridge: Arc<ExecutionBridge>,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        let now = Utc::now();
        Self {
            hub: CollaborationHub::new(
                session_id.clone(),
                config.lock_ttl_sec,
                config.broadcast_capacity,
            ),
            session_id,
            created_at: now,
            last_active_ms: AtomicI64::new(now.timestamp_millis()),
            widgets: DashMap::new(),
            persistence,
            bridge,
            config,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            widget_count: self.widgets.len(),
        }
    }

    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_active_ms.load(Ordering::Relaxed))
            .unwrap_or(self.created_at)
    }

    fn slot(&self, widget_id: &WidgetId) -> Result<Arc<WidgetSlot>, LiveError> {
        self.widgets
            .get(widget_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| {
                LiveError::NotFound(format!(
                    "widget {} in session {}",
                    widget_id, self.session_id
                ))
            })
    }

    /// Whether `slot` is still the registered slot of `widget_id`. Checked
    /// after taking a write lane: the widget may have been removed meanwhile.
    fn ensure_current(&self, widget_id: &WidgetId, slot: &Arc<WidgetSlot>) -> Result<(), LiveError> {
        match self.widgets.get(widget_id) {
            Some(s) if Arc::ptr_eq(s.value(), slot) => Ok(()),
            _ => Err(LiveError::NotFound(format!(
                "widget {} in session {}",
                widget_id, self.session_id
            ))),
        }
    }

    fn with_lock(&self, mut record: WidgetRecord) -> WidgetRecord {
        record.lock = self.hub.current_lock(&record.widget_id);
        record
    }

    async fn push_history(&self, slot: &WidgetSlot, entry: HistoryEntry) {
        let mut history = slot.history.write().await;
        history.push_back(entry);
        while history.len() > self.config.history_limit.max(1) {
            history.pop_front();
        }
    }

    /// Write `record` to the store. When the store already holds this or a
    /// newer version (written by another process sharing it), the record
    /// moves past the stored version and the write is retried.
    /// Must be called with the widget's write lane held.
    async fn persist(&self, record: &mut WidgetRecord) -> Result<()> {
        let requested = record.version;
        for _ in 0..PERSIST_ATTEMPTS {
            if self.persistence.save(&PersistedWidget::from(&*record)).await? {
                return Ok(());
            }
            let stored = self
                .persistence
                .load(&self.session_id, &record.widget_id)
                .await?
                .map(|p| p.version)
                .unwrap_or(record.version);
            tracing::warn!(
                session_id = %self.session_id,
                widget_id = %record.widget_id,
                version = record.version,
                stored,
                "store is ahead of the live record, moving past it"
            );
            record.version = record.version.max(stored) + 1;
        }
        Err(LiveError::StaleWrite {
            widget_id: record.widget_id.to_string(),
            expected: requested,
            current: record.version,
        }
        .into())
    }

    /// Store a committed record: persist, publish, record history, notify.
    /// Returns the committed version. Must be called with the widget's write
    /// lane held.
    async fn commit(
        &self,
        slot: &WidgetSlot,
        mut record: WidgetRecord,
        origin: Option<ClientId>,
    ) -> Result<u64> {
        self.persist(&mut record).await.inspect_err(|e| {
            tracing::error!(
                session_id = %self.session_id,
                widget_id = %record.widget_id,
                version = record.version,
                "persisting widget state failed, commit aborted: {:?}",
                e
            )
        })?;
        let version = record.version;
        *slot.record.write().await = record.clone();
        self.push_history(
            slot,
            HistoryEntry {
                version,
                value: record.value.clone(),
                updated_at: record.last_updated,
                origin: origin.clone(),
            },
        )
        .await;
        self.hub.broadcast(CollaborationEvent::ValueCommitted {
            widget_id: record.widget_id,
            value: record.value,
            version,
            origin,
            updated_at: record.last_updated,
        });
        Ok(version)
    }

    /// Create a widget, or idempotently re-register an existing one.
    ///
    /// A new widget is hydrated from persistence when a snapshot of the same
    /// type exists; the supplied value is used otherwise. In restore mode the
    /// supplied value wins over both the snapshot and the live value.
    pub async fn register_widget(
        self: &Arc<Self>,
        req: RegisterWidgetRequest,
    ) -> Result<WidgetRecord> {
        self.touch();
        let this = self.clone();
        detached(async move { this.register(req).await }).await
    }

    async fn register(&self, req: RegisterWidgetRequest) -> Result<WidgetRecord> {
        loop {
            if let Ok(slot) = self.slot(&req.widget_id) {
                match self.reregister(&slot, req.clone()).await? {
                    Some(record) => return Ok(record),
                    // removed while we waited for its lane
                    None => continue,
                }
            }
            if let Some(record) = self.create(&req).await? {
                return Ok(record);
            }
        }
    }

    /// Register a widget that has no slot yet. `None` when another
    /// registration got there first.
    async fn create(&self, req: &RegisterWidgetRequest) -> Result<Option<WidgetRecord>> {
        let constraints = derive_constraints(req.widget_type, &req.properties);
        let hydrated = self
            .persistence
            .load(&self.session_id, &req.widget_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(
                    session_id = %self.session_id,
                    widget_id = %req.widget_id,
                    "hydration failed, using supplied value: {:?}",
                    e
                );
                None
            })
            .filter(|p| p.widget_type == req.widget_type);
        let hydrated_value = hydrated.as_ref().map(|p| p.value.clone());
        let candidate = match req.mode {
            RegisterMode::Keep => hydrated_value.clone().or_else(|| req.value.clone()),
            RegisterMode::Restore => req.value.clone().or_else(|| hydrated_value.clone()),
        }
        .unwrap_or_else(|| req.widget_type.default_value(&req.properties));
        let value = normalize(&constraints, &candidate)
            .map_err(|v| validation_error(&req.widget_id, v.reason))?;
        let base_version = hydrated.as_ref().map(|p| p.version).unwrap_or(0);
        let version = match &hydrated_value {
            Some(prev) if prev != &value => base_version + 1,
            _ => base_version,
        };
        let mut record = WidgetRecord {
            session_id: self.session_id.clone(),
            widget_id: req.widget_id.clone(),
            widget_type: req.widget_type,
            value,
            properties: req.properties.clone(),
            constraints,
            version,
            last_updated: hydrated
                .as_ref()
                .filter(|p| p.version == version)
                .map(|p| p.last_updated)
                .unwrap_or_else(Utc::now),
            lock: None,
        };

        // the lane is held before the slot is published so no update can
        // commit ahead of the initial version
        let slot = Arc::new(WidgetSlot::new(record.clone()));
        let _lane = slot.write_lane.lock().await;
        match self.widgets.entry(req.widget_id.clone()) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(e) => {
                e.insert(slot.clone());
            }
        }
        if hydrated.as_ref().map(|p| p.version) != Some(record.version) {
            match self.persist(&mut record).await {
                Ok(()) => *slot.record.write().await = record.clone(),
                Err(e) => {
                    tracing::warn!(widget_id = %record.widget_id, "initial snapshot failed: {:?}", e)
                }
            }
        }
        self.push_history(
            &slot,
            HistoryEntry {
                version: record.version,
                value: record.value.clone(),
                updated_at: record.last_updated,
                origin: None,
            },
        )
        .await;
        tracing::debug!(
            session_id = %self.session_id,
            widget_id = %record.widget_id,
            version = record.version,
            hydrated = hydrated.is_some(),
            "widget registered"
        );
        Ok(Some(self.with_lock(record)))
    }

    /// `None` when the slot was removed before its lane was free.
    async fn reregister(
        &self,
        slot: &Arc<WidgetSlot>,
        req: RegisterWidgetRequest,
    ) -> Result<Option<WidgetRecord>> {
        let _lane = slot.write_lane.lock().await;
        if self.ensure_current(&req.widget_id, slot).is_err() {
            return Ok(None);
        }
        let current = slot.record.read().await.clone();
        let constraints = derive_constraints(req.widget_type, &req.properties);
        let type_changed = current.widget_type != req.widget_type;
        let properties_changed = current.properties != req.properties;
        let candidate = match (req.mode, req.value) {
            (RegisterMode::Restore, Some(v)) => v,
            (_, Some(v)) if type_changed => v,
            _ if type_changed => req.widget_type.default_value(&req.properties),
            _ => current.value.clone(),
        };
        let value = normalize(&constraints, &candidate)
            .map_err(|v| validation_error(&req.widget_id, v.reason))?;
        let mut next = current.clone();
        next.widget_type = req.widget_type;
        next.properties = req.properties;
        next.constraints = constraints;
        if value != current.value || type_changed {
            next.value = value;
            next.version = current.version + 1;
            next.last_updated = Utc::now();
            next.version = self.commit(slot, next.clone(), None).await?;
        } else {
            if properties_changed {
                // same version, so the versioned save would refuse it
                self.persistence
                    .replace(&PersistedWidget::from(&next))
                    .await
                    .inspect_err(|e| {
                        tracing::error!(
                            session_id = %self.session_id,
                            widget_id = %next.widget_id,
                            "persisting new properties failed: {:?}",
                            e
                        )
                    })?;
            }
            *slot.record.write().await = next.clone();
        }
        tracing::debug!(
            session_id = %self.session_id,
            widget_id = %next.widget_id,
            version = next.version,
            "widget re-registered"
        );
        Ok(Some(self.with_lock(next)))
    }

    /// Validate, lock-check and commit a new value, then forward it to the
    /// execution engine. An unchanged value is a no-op that keeps the version.
    pub async fn update_value(
        self: &Arc<Self>,
        widget_id: &WidgetId,
        req: UpdateValueRequest,
    ) -> Result<UpdateOutcome> {
        self.touch();
        let this = self.clone();
        let widget_id = widget_id.clone();
        detached(async move { this.apply_update(&widget_id, req).await }).await
    }

    async fn apply_update(&self, widget_id: &WidgetId, req: UpdateValueRequest) -> Result<UpdateOutcome> {
        let slot = self.slot(widget_id)?;
        let _lane = slot.write_lane.lock().await;
        self.ensure_current(widget_id, &slot)?;
        let current = slot.record.read().await.clone();

        if let Err(e) = self.hub.check_write(widget_id, req.holder_id.as_ref()) {
            tracing::debug!(widget_id = %widget_id, "write rejected: {}", e);
            return Err(e.into());
        }
        let value = normalize(&current.constraints, &req.value)
            .map_err(|v| validation_error(widget_id, v.reason))?;
        match req.expected_version {
            Some(expected) if expected < current.version => {
                return Err(LiveError::StaleWrite {
                    widget_id: widget_id.to_string(),
                    expected,
                    current: current.version,
                }
                .into())
            }
            Some(expected) if expected > current.version => {
                return Err(LiveError::InvalidParameter(format!(
                    "expected version {} is ahead of current version {}",
                    expected, current.version
                ))
                .into())
            }
            _ => {}
        }
        if value == current.value {
            tracing::debug!(widget_id = %widget_id, version = current.version, "unchanged value, nothing to commit");
            return Ok(UpdateOutcome {
                widget_id: widget_id.clone(),
                value,
                version: current.version,
                changed: false,
                outputs: vec![],
                execution_error: None,
            });
        }

        let mut next = current;
        next.value = value.clone();
        next.version += 1;
        next.last_updated = Utc::now();
        let version = self.commit(&slot, next, req.holder_id).await?;
        tracing::debug!(session_id = %self.session_id, widget_id = %widget_id, version, "value committed");

        // the commit stands even if the engine fails
        let (outputs, execution_error) =
            match self.bridge.forward_value(&self.session_id, widget_id, &value).await {
                Ok(ExecutionOutput { outputs, error }) => (outputs, error),
                Err(e) => (vec![], Some(e.to_string())),
            };
        Ok(UpdateOutcome {
            widget_id: widget_id.clone(),
            value,
            version,
            changed: true,
            outputs,
            execution_error,
        })
    }

    /// Apply updates in priority order (high, normal, low; stable within a
    /// priority). Each item succeeds or fails on its own.
    pub async fn batch_update(
        self: &Arc<Self>,
        updates: Vec<BatchUpdateItem>,
        holder_id: Option<ClientId>,
    ) -> BatchUpdateResponse {
        let total = updates.len();
        let mut response = BatchUpdateResponse {
            total,
            ..Default::default()
        };
        for item in updates.into_iter().sorted_by_key(|u| u.priority.rank()) {
            let mut req = UpdateValueRequest::new(item.value);
            req.holder_id = holder_id.clone();
            match self.update_value(&item.widget_id, req).await {
                Ok(_) => response.succeeded.push(item.widget_id),
                Err(e) => response.failed.push(BatchFailure {
                    id: item.widget_id,
                    reason: e.to_string(),
                    code: LiveError::classify(&e),
                }),
            }
        }
        tracing::debug!(
            session_id = %self.session_id,
            total,
            failed = response.failed.len(),
            "batch update applied"
        );
        response
    }

    pub async fn get_state(&self, widget_id: &WidgetId) -> Result<WidgetRecord> {
        let slot = self.slot(widget_id)?;
        let record = slot.record.read().await.clone();
        Ok(self.with_lock(record))
    }

    pub async fn get_all(&self) -> Vec<WidgetRecord> {
        let slots: Vec<Arc<WidgetSlot>> = self.widgets.iter().map(|e| e.value().clone()).collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            let record = slot.record.read().await.clone();
            records.push(self.with_lock(record));
        }
        records.sort_by(|a, b| a.widget_id.cmp(&b.widget_id));
        records
    }

    pub async fn get_constraints(&self, widget_id: &WidgetId) -> Result<ConstraintDescriptor> {
        let slot = self.slot(widget_id)?;
        let constraints = slot.record.read().await.constraints.clone();
        Ok(constraints)
    }

    /// Committed versions newer than `since`, oldest first.
    pub async fn history(&self, widget_id: &WidgetId, since: Option<u64>) -> Result<Vec<HistoryEntry>> {
        let slot = self.slot(widget_id)?;
        let history = slot.history.read().await;
        Ok(history
            .iter()
            .filter(|h| since.map(|s| h.version > s).unwrap_or(true))
            .cloned()
            .collect())
    }

    pub async fn unregister(self: &Arc<Self>, widget_id: &WidgetId) -> Result<bool> {
        self.touch();
        let this = self.clone();
        let widget_id = widget_id.clone();
        detached(async move { this.remove(&widget_id).await }).await
    }

    /// Remove once in-flight writes to the widget are done, so nothing is
    /// committed after `WidgetRemoved`.
    async fn remove(&self, widget_id: &WidgetId) -> Result<bool> {
        let Ok(slot) = self.slot(widget_id) else {
            return Ok(false);
        };
        let _lane = slot.write_lane.lock().await;
        let removed = self
            .widgets
            .remove_if(widget_id, |_, s| Arc::ptr_eq(s, &slot))
            .is_some();
        if removed {
            self.hub.drop_widget(widget_id);
            tracing::debug!(session_id = %self.session_id, widget_id = %widget_id, "widget unregistered");
        }
        Ok(removed)
    }

    pub fn request_lock(&self, widget_id: &WidgetId, holder_id: &ClientId) -> Result<bool> {
        self.touch();
        self.slot(widget_id)?;
        Ok(self.hub.request_lock(widget_id, holder_id))
    }

    pub fn release_lock(&self, widget_id: &WidgetId, holder_id: &ClientId) -> Result<bool> {
        self.touch();
        self.slot(widget_id)?;
        Ok(self.hub.release_lock(widget_id, holder_id))
    }

    pub fn subscribe(&self, observer: Option<ClientId>) -> Observer {
        self.hub.subscribe(observer)
    }

    pub async fn execute_cell(&self, cell_id: &str, code: &str) -> Result<ExecutionOutput> {
        self.touch();
        self.bridge.execute_cell(&self.session_id, cell_id, code).await
    }

    /// Engine session variables; those named after a widget come back as
    /// that widget's value.
    pub async fn engine_state(&self) -> Result<serde_json::Value> {
        let widget_types: HashMap<String, WidgetType> = self
            .get_all()
            .await
            .into_iter()
            .map(|r| (r.widget_id.to_string(), r.widget_type))
            .collect();
        self.bridge.session_state(&self.session_id, &widget_types).await
    }

    /// Tear down: drop widgets and locks, clear session-scoped persistence.
    pub(crate) async fn close(&self) {
        let ids: Vec<WidgetId> = self.widgets.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id).await.ok();
        }
        self.hub.clear();
        if let Err(e) = self.persistence.end_session(&self.session_id).await {
            tracing::warn!(session_id = %self.session_id, "clearing session persistence failed: {:?}", e);
        }
    }

    /// Value currently held for `widget_id`, if registered.
    pub async fn value_of(&self, widget_id: &WidgetId) -> Option<WidgetValue> {
        let slot = self.slot(widget_id).ok()?;
        let value = slot.record.read().await.value.clone();
        Some(value)
    }
}
