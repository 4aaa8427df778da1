use super::{PersistedWidget, WidgetStateRepository};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use livecell_base::widget::{SessionId, WidgetId};
use std::sync::Arc;

/// Ephemeral strategy: snapshots live only in this process and are dropped
/// with the session.
#[derive(Clone, Debug, Default)]
pub struct MemoryWidgetStateRepository {
    states: Arc<DashMap<(SessionId, WidgetId), PersistedWidget>>,
}

impl MemoryWidgetStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl WidgetStateRepository for MemoryWidgetStateRepository {
    async fn save(&self, state: &PersistedWidget) -> Result<bool> {
        let key = (state.session_id.clone(), state.widget_id.clone());
        let stored = match self.states.entry(key) {
            Entry::Occupied(mut e) => {
                if e.get().version < state.version {
                    e.insert(state.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(state.clone());
                true
            }
        };
        tracing::debug!(
            session_id = %state.session_id,
            widget_id = %state.widget_id,
            version = state.version,
            stored,
            "save widget state to memory"
        );
        Ok(stored)
    }

    async fn load(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
    ) -> Result<Option<PersistedWidget>> {
        Ok(self
            .states
            .get(&(session_id.clone(), widget_id.clone()))
            .map(|e| e.value().clone()))
    }

    async fn delete(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<bool> {
        Ok(self
            .states
            .remove(&(session_id.clone(), widget_id.clone()))
            .is_some())
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<u64> {
        let before = self.states.len();
        self.states.retain(|(sid, _), _| sid != session_id);
        Ok(before.saturating_sub(self.states.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::persistence::test_support::{assert_versioned_store, slider_state};

    #[tokio::test]
    async fn test_versioned_store() {
        let repo = MemoryWidgetStateRepository::new();
        assert_versioned_store(&repo, "sess-memory").await;
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn test_delete_session_keeps_other_sessions() {
        let repo = MemoryWidgetStateRepository::new();
        repo.save(&slider_state("a", "w1", 1.0, 1)).await.unwrap();
        repo.save(&slider_state("a", "w2", 1.0, 1)).await.unwrap();
        repo.save(&slider_state("b", "w1", 1.0, 1)).await.unwrap();
        assert_eq!(repo.delete_session(&"a".into()).await.unwrap(), 2);
        assert_eq!(repo.len(), 1);
        assert!(repo.load(&"b".into(), &"w1".into()).await.unwrap().is_some());
    }
}
