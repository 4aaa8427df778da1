pub mod autosave;
pub mod manager;
pub mod memory;
pub mod rdb;
pub mod redis;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use livecell_base::widget::{
    SessionId, WidgetId, WidgetProperties, WidgetRecord, WidgetType, WidgetValue,
};
use livecell_base::DEFAULT_CACHE_TTL_SEC;
use serde::{Deserialize, Serialize};

/// Storage backend, chosen once from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceKind {
    /// in-memory, lives as long as the session
    #[default]
    Ephemeral,
    /// sqlite file, survives restarts of this process
    Local,
    /// redis, shared across processes and devices
    Remote,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct PersistenceConfig {
    pub kind: PersistenceKind,
    pub cache_ttl_sec: u64,
    pub cache_max_capacity: u64,
    pub sqlite_url: String,
    pub redis_url: String,
    /// 0: no expiry
    pub redis_ttl_sec: u64,
    pub autosave_interval_sec: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            kind: PersistenceKind::Ephemeral,
            cache_ttl_sec: DEFAULT_CACHE_TTL_SEC,
            cache_max_capacity: 10_000,
            sqlite_url: "sqlite://livecell.sqlite3?mode=rwc".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_ttl_sec: 0,
            autosave_interval_sec: 30,
        }
    }
}

/// Snapshot of a widget outside the live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedWidget {
    pub session_id: SessionId,
    pub widget_id: WidgetId,
    pub widget_type: WidgetType,
    pub value: WidgetValue,
    pub properties: WidgetProperties,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
}

impl From<&WidgetRecord> for PersistedWidget {
    fn from(record: &WidgetRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            widget_id: record.widget_id.clone(),
            widget_type: record.widget_type,
            value: record.value.clone(),
            properties: record.properties.clone(),
            version: record.version,
            last_updated: record.last_updated,
        }
    }
}

/// Key-value store of widget snapshots keyed by `(session, widget)`.
///
/// Writes are versioned: a record is only replaced by one with a strictly
/// greater version.
#[async_trait]
pub trait WidgetStateRepository: Send + Sync + std::fmt::Debug + 'static {
    /// # Returns
    /// - `Ok(true)` if stored
    /// - `Ok(false)` if a record with the same or a newer version exists
    async fn save(&self, state: &PersistedWidget) -> Result<bool>;

    async fn load(&self, session_id: &SessionId, widget_id: &WidgetId)
        -> Result<Option<PersistedWidget>>;

    /// # Returns
    /// - `Ok(true)` if deleted
    /// - `Ok(false)` if not found
    async fn delete(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<bool>;

    /// Delete every widget of a session, returning the number removed.
    async fn delete_session(&self, session_id: &SessionId) -> Result<u64>;

    async fn batch_save(&self, states: &[PersistedWidget]) -> Result<Vec<bool>> {
        let mut results = Vec::with_capacity(states.len());
        for state in states {
            results.push(self.save(state).await?);
        }
        Ok(results)
    }

    async fn batch_load(
        &self,
        session_id: &SessionId,
        widget_ids: &[WidgetId],
    ) -> Result<Vec<PersistedWidget>> {
        let mut found = Vec::with_capacity(widget_ids.len());
        for id in widget_ids {
            if let Some(state) = self.load(session_id, id).await? {
                found.push(state);
            }
        }
        Ok(found)
    }
}

pub trait UsePersistenceManager {
    fn persistence_manager(&self) -> &manager::PersistenceManager;
}
