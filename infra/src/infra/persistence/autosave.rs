//! Periodic snapshotting of changed widgets.

use super::manager::PersistenceManager;
use super::PersistedWidget;
use anyhow::Result;
use async_trait::async_trait;
use livecell_base::widget::{SessionId, WidgetId, WidgetValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Anything holding committed widget state that should be snapshotted.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn snapshot(&self) -> Vec<PersistedWidget>;
}

/// Saves only widgets whose value or version changed since the previous
/// snapshot.
#[derive(Debug)]
pub struct AutoSaver {
    manager: Arc<PersistenceManager>,
    last_snapshot: Mutex<HashMap<(SessionId, WidgetId), (u64, WidgetValue)>>,
}

impl AutoSaver {
    pub fn new(manager: Arc<PersistenceManager>) -> Self {
        Self {
            manager,
            last_snapshot: Mutex::new(HashMap::new()),
        }
    }

    /// One snapshot pass; returns the number of widgets written.
    pub async fn run_once(&self, source: &dyn SnapshotSource) -> Result<usize> {
        let states = source.snapshot().await;
        let mut last = self.last_snapshot.lock().await;
        let changed: Vec<PersistedWidget> = states
            .into_iter()
            .filter(|s| {
                last.get(&(s.session_id.clone(), s.widget_id.clone()))
                    .map(|(version, value)| *version != s.version || value != &s.value)
                    .unwrap_or(true)
            })
            .collect();
        if changed.is_empty() {
            return Ok(0);
        }
        let results = self.manager.batch_save(&changed).await?;
        let mut written = 0;
        // a refused write means the store already holds this or a newer version
        for (state, stored) in changed.into_iter().zip(results) {
            if stored {
                written += 1;
            }
            last.insert(
                (state.session_id, state.widget_id),
                (state.version, state.value),
            );
        }
        tracing::debug!(written, "auto-save pass finished");
        Ok(written)
    }

    /// Forget the snapshot of one widget so the next pass writes it again.
    pub async fn forget(&self, session_id: &SessionId, widget_id: &WidgetId) {
        self.last_snapshot
            .lock()
            .await
            .remove(&(session_id.clone(), widget_id.clone()));
    }

    pub fn spawn(
        self: Arc<Self>,
        source: Arc<dyn SnapshotSource>,
        interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once(source.as_ref()).await {
                            tracing::error!("auto-save failed: {:?}", e);
                        }
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            // last pass so nothing committed since the previous tick is lost
                            if let Err(e) = self.run_once(source.as_ref()).await {
                                tracing::error!("final auto-save failed: {:?}", e);
                            }
                            tracing::debug!("auto-save task shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
