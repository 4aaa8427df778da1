use super::coordinator::SessionCoordinator;
use super::CoordinatorConfig;
use anyhow::Result;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use infra::infra::execution::bridge::ExecutionBridge;
use infra::infra::persistence::manager::PersistenceManager;
use livecell_base::error::LiveError;
use livecell_base::protocol::SessionInfo;
use livecell_base::widget::SessionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug)]
struct RegistryInner {
    sessions: DashMap<SessionId, Arc<SessionCoordinator>>,
    persistence: Arc<PersistenceManager>,
    bridge: Arc<ExecutionBridge>,
    config: Arc<CoordinatorConfig>,
}

impl RegistryInner {
    async fn teardown(&self, coordinator: Arc<SessionCoordinator>) {
        coordinator.close().await;
        self.bridge.end_session(coordinator.session_id()).await.ok();
        tracing::info!(session_id = %coordinator.session_id(), "session ended");
    }

    /// Ends every session idle for longer than the ttl; returns how many.
    async fn evict_idle(&self, ttl: chrono::Duration) -> usize {
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| now.signed_duration_since(e.value().last_active()) > ttl)
            .map(|e| e.key().clone())
            .collect();
        let mut evicted = 0;
        for sid in expired {
            // re-check under the entry: the session may have been touched meanwhile
            let removed = self.sessions.remove_if(&sid, |_, c| {
                Utc::now().signed_duration_since(c.last_active()) > ttl
            });
            if let Some((_, coordinator)) = removed {
                tracing::debug!(session_id = %sid, "evicting idle session");
                self.teardown(coordinator).await;
                evicted += 1;
            }
        }
        evicted
    }
}

/// One `SessionCoordinator` per live session. Idle sessions are evicted by
/// a background task which stops when the registry is dropped.
#[derive(Debug)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
    cleanup_started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl SessionRegistry {
    pub fn new(
        persistence: Arc<PersistenceManager>,
        bridge: Arc<ExecutionBridge>,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                persistence,
                bridge,
                config,
            }),
            cleanup_started: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Start the idle-session cleanup task (once). No-op when
    /// `session_ttl_sec` is 0.
    pub fn start_cleanup_task(&self) {
        let ttl_sec = self.inner.config.session_ttl_sec;
        if ttl_sec == 0 || self.cleanup_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let interval_sec = (ttl_sec / 2).clamp(10, 60);
        let ttl = chrono::Duration::seconds(ttl_sec.min(i64::MAX as u64) as i64);
        let inner: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_sec));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(inner) = inner.upgrade() else {
                            break;
                        };
                        let evicted = inner.evict_idle(ttl).await;
                        if evicted > 0 {
                            tracing::info!(evicted, "idle sessions evicted");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
            tracing::debug!("session cleanup task stopped");
        });
        tracing::debug!(interval_sec, ttl_sec, "session cleanup task started");
    }

    /// Coordinator for `session_id`, creating it when absent (random id when
    /// none is given). The execution engine is told once per new session.
    pub async fn start_session(
        &self,
        session_id: Option<SessionId>,
    ) -> Result<Arc<SessionCoordinator>> {
        let session_id = session_id.unwrap_or_else(SessionId::random);
        let coordinator = match self.inner.sessions.entry(session_id.clone()) {
            Entry::Occupied(e) => {
                let c = e.get().clone();
                c.touch();
                return Ok(c);
            }
            Entry::Vacant(e) => e
                .insert(Arc::new(SessionCoordinator::new(
                    session_id.clone(),
                    self.inner.persistence.clone(),
                    self.inner.bridge.clone(),
                    self.inner.config.clone(),
                )))
                .value()
                .clone(),
        };
        if let Err(e) = self.inner.bridge.start_session(&session_id).await {
            tracing::warn!(session_id = %session_id, "execution engine did not start session: {:?}", e);
        }
        tracing::info!(session_id = %session_id, "session started");
        Ok(coordinator)
    }

    pub fn get(&self, session_id: &SessionId) -> Result<Arc<SessionCoordinator>> {
        self.inner
            .sessions
            .get(session_id)
            .map(|c| c.value().clone())
            .ok_or_else(|| LiveError::NotFound(format!("session {}", session_id)).into())
    }

    /// Tear a session down. `false` when it wasn't live.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<bool> {
        match self.inner.sessions.remove(session_id) {
            Some((_, coordinator)) => {
                self.inner.teardown(coordinator).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.inner.sessions.iter().map(|e| e.value().info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    pub fn persistence(&self) -> &Arc<PersistenceManager> {
        &self.inner.persistence
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecell_base::protocol::{RegisterWidgetRequest, UpdateValueRequest};
    use livecell_base::widget::{WidgetProperties, WidgetType, WidgetValue};

    fn registry(session_ttl_sec: u64) -> SessionRegistry {
        SessionRegistry::new(
            Arc::new(PersistenceManager::ephemeral()),
            Arc::new(ExecutionBridge::disabled()),
            Arc::new(CoordinatorConfig {
                session_ttl_sec,
                ..Default::default()
            }),
        )
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let reg = registry(0);
        let sid = SessionId::new("s1");
        let a = reg.start_session(Some(sid.clone())).await.unwrap();
        let b = reg.start_session(Some(sid.clone())).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let random = reg.start_session(None).await.unwrap();
        assert_ne!(random.session_id(), &sid);
        assert_eq!(reg.list().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let reg = registry(0);
        let err = reg.get(&SessionId::new("nope")).unwrap_err();
        assert_eq!(
            LiveError::classify(&err),
            livecell_base::error::ErrorKind::NotFound
        );
        assert!(!reg.end_session(&SessionId::new("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_end_session_closes_observers_and_ephemeral_state() {
        let reg = registry(0);
        let sid = SessionId::new("s1");
        let c = reg.start_session(Some(sid.clone())).await.unwrap();
        c.register_widget(RegisterWidgetRequest::new(
            "w1",
            WidgetType::Switch,
            Some(WidgetValue::Bool(false)),
            WidgetProperties::default(),
        ))
        .await
        .unwrap();
        c.update_value(&"w1".into(), UpdateValueRequest::new(true.into()))
            .await
            .unwrap();
        let mut observer = c.subscribe(None);
        drop(c);

        assert!(reg.end_session(&sid).await.unwrap());
        assert!(reg.get(&sid).is_err());
        // widgetRemoved, then closed
        assert!(observer.recv().await.is_some());
        assert!(observer.recv().await.is_none());
        assert!(reg
            .persistence()
            .load(&sid, &"w1".into())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let reg = registry(20);
        reg.start_session(Some(SessionId::new("idle"))).await.unwrap();
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.inner.evict_idle(chrono::Duration::seconds(-1)).await, 1);
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_active_sessions_survive_eviction() {
        let reg = registry(3600);
        reg.start_session(Some(SessionId::new("busy"))).await.unwrap();
        assert_eq!(reg.inner.evict_idle(chrono::Duration::seconds(3600)).await, 0);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_with_registry() {
        let reg = registry(20);
        reg.start_cleanup_task();
        reg.start_cleanup_task();
        let weak = Arc::downgrade(&reg.inner);
        drop(reg);
        assert!(weak.upgrade().is_none());
    }
}
