use super::memory::MemoryWidgetStateRepository;
use super::rdb::RdbWidgetStateRepository;
use super::redis::RedisWidgetStateRepository;
use super::{PersistedWidget, PersistenceConfig, PersistenceKind, WidgetStateRepository};
use crate::infra::resource::{setup_redis_pool, setup_sqlite_pool};
use anyhow::Result;
use livecell_base::widget::{SessionId, WidgetId};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

type CacheKey = (SessionId, WidgetId);

/// Front of the configured persistence strategy.
///
/// Reads go through a short-lived cache. When the configured backend fails,
/// the call is served by the in-memory store instead so a flaky database
/// degrades durability, not availability.
#[derive(Clone)]
pub struct PersistenceManager {
    kind: PersistenceKind,
    primary: Arc<dyn WidgetStateRepository>,
    fallback: MemoryWidgetStateRepository,
    cache: Cache<CacheKey, PersistedWidget>,
}

impl std::fmt::Debug for PersistenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceManager")
            .field("kind", &self.kind)
            .field("primary", &self.primary)
            .field("cached", &self.cache.entry_count())
            .finish()
    }
}

impl PersistenceManager {
    pub async fn new(config: &PersistenceConfig) -> Result<Self> {
        let primary: Arc<dyn WidgetStateRepository> = match config.kind {
            PersistenceKind::Ephemeral => Arc::new(MemoryWidgetStateRepository::new()),
            PersistenceKind::Local => Arc::new(RdbWidgetStateRepository::new(
                setup_sqlite_pool(&config.sqlite_url).await?,
            )),
            PersistenceKind::Remote => Arc::new(RedisWidgetStateRepository::new(
                setup_redis_pool(&config.redis_url)?,
                config.redis_ttl_sec,
            )),
        };
        tracing::info!(kind = ?config.kind, "persistence strategy selected");
        Ok(Self::with_repository(config.kind, primary, config))
    }

    pub fn with_repository(
        kind: PersistenceKind,
        primary: Arc<dyn WidgetStateRepository>,
        config: &PersistenceConfig,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.cache_max_capacity)
            .time_to_live(Duration::from_secs(config.cache_ttl_sec))
            .build();
        Self {
            kind,
            primary,
            fallback: MemoryWidgetStateRepository::new(),
            cache,
        }
    }

    pub fn ephemeral() -> Self {
        Self::with_repository(
            PersistenceKind::Ephemeral,
            Arc::new(MemoryWidgetStateRepository::new()),
            &PersistenceConfig::default(),
        )
    }

    pub fn kind(&self) -> PersistenceKind {
        self.kind
    }

    fn key(session_id: &SessionId, widget_id: &WidgetId) -> CacheKey {
        (session_id.clone(), widget_id.clone())
    }

    pub async fn save(&self, state: &PersistedWidget) -> Result<bool> {
        let stored = match self.primary.save(state).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(
                    session_id = %state.session_id,
                    widget_id = %state.widget_id,
                    kind = ?self.kind,
                    "save failed, falling back to memory: {:?}",
                    e
                );
                self.fallback.save(state).await?
            }
        };
        let key = Self::key(&state.session_id, &state.widget_id);
        if stored {
            self.cache.insert(key, state.clone()).await;
        } else {
            self.cache.invalidate(&key).await;
        }
        Ok(stored)
    }

    /// Overwrite the snapshot whatever version it has. For changes that
    /// don't move the version (new properties on an unchanged value).
    pub async fn replace(&self, state: &PersistedWidget) -> Result<()> {
        self.delete(&state.session_id, &state.widget_id).await?;
        if !self.save(state).await? {
            tracing::warn!(
                session_id = %state.session_id,
                widget_id = %state.widget_id,
                "snapshot rewritten concurrently while replacing"
            );
        }
        Ok(())
    }

    pub async fn load(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
    ) -> Result<Option<PersistedWidget>> {
        let key = Self::key(session_id, widget_id);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(Some(hit));
        }
        let primary = match self.primary.load(session_id, widget_id).await {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    widget_id = %widget_id,
                    kind = ?self.kind,
                    "load failed, falling back to memory: {:?}",
                    e
                );
                None
            }
        };
        // a write that fell back may be newer than what the backend holds
        let fallback = self.fallback.load(session_id, widget_id).await?;
        let found = match (primary, fallback) {
            (Some(p), Some(f)) => Some(if f.version > p.version { f } else { p }),
            (p, f) => p.or(f),
        };
        if let Some(state) = &found {
            self.cache.insert(key, state.clone()).await;
        }
        Ok(found)
    }

    pub async fn delete(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<bool> {
        self.cache.invalidate(&Self::key(session_id, widget_id)).await;
        let in_fallback = self.fallback.delete(session_id, widget_id).await?;
        let in_primary = self.primary.delete(session_id, widget_id).await?;
        Ok(in_primary || in_fallback)
    }

    pub async fn batch_save(&self, states: &[PersistedWidget]) -> Result<Vec<bool>> {
        match self.primary.batch_save(states).await {
            Ok(results) => {
                for (state, stored) in states.iter().zip(results.iter()) {
                    let key = Self::key(&state.session_id, &state.widget_id);
                    if *stored {
                        self.cache.insert(key, state.clone()).await;
                    } else {
                        self.cache.invalidate(&key).await;
                    }
                }
                Ok(results)
            }
            Err(e) => {
                tracing::warn!(kind = ?self.kind, count = states.len(), "batch save failed, saving one by one: {:?}", e);
                let mut results = Vec::with_capacity(states.len());
                for state in states {
                    results.push(self.save(state).await?);
                }
                Ok(results)
            }
        }
    }

    pub async fn batch_load(
        &self,
        session_id: &SessionId,
        widget_ids: &[WidgetId],
    ) -> Result<Vec<PersistedWidget>> {
        let loaded =
            futures::future::try_join_all(widget_ids.iter().map(|id| self.load(session_id, id)))
                .await?;
        Ok(loaded.into_iter().flatten().collect())
    }

    /// Drop what only lives as long as the session: the cache entries, the
    /// fallback copies and, for the ephemeral strategy, the stored states.
    pub async fn end_session(&self, session_id: &SessionId) -> Result<u64> {
        let keys: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(k, _)| &k.0 == session_id)
            .map(|(k, _)| (*k).clone())
            .collect();
        for key in keys {
            self.cache.invalidate(&key).await;
        }
        let mut removed = self.fallback.delete_session(session_id).await?;
        if self.kind == PersistenceKind::Ephemeral {
            removed += self.primary.delete_session(session_id).await?;
        }
        tracing::debug!(session_id = %session_id, removed, "persistence cleared for session");
        Ok(removed)
    }
}
