use super::{PersistedWidget, WidgetStateRepository};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use livecell_base::error::LiveError;
use livecell_base::widget::{SessionId, WidgetId, WidgetType};
use sqlx::sqlite::SqlitePool;
use sqlx::{Executor, Sqlite};

#[derive(sqlx::FromRow, Debug, Clone)]
struct WidgetStateRow {
    session_id: String,
    widget_id: String,
    widget_type: String,
    value: String,
    properties: String,
    version: i64,
    last_updated: i64,
}

impl WidgetStateRow {
    fn to_state(&self) -> Result<PersistedWidget> {
        Ok(PersistedWidget {
            session_id: SessionId::new(self.session_id.clone()),
            widget_id: WidgetId::new(self.widget_id.clone()),
            widget_type: self.widget_type.parse::<WidgetType>()?,
            value: serde_json::from_str(&self.value)
                .map_err(LiveError::SerdeJsonError)
                .context("decode stored widget value")?,
            properties: serde_json::from_str(&self.properties)
                .map_err(LiveError::SerdeJsonError)
                .context("decode stored widget properties")?,
            version: self.version.max(0) as u64,
            last_updated: DateTime::<Utc>::from_timestamp_millis(self.last_updated)
                .unwrap_or_default(),
        })
    }
}

/// Durable-local strategy backed by a sqlite file.
#[derive(Clone, Debug)]
pub struct RdbWidgetStateRepository {
    pool: SqlitePool,
}

impl RdbWidgetStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    const UPSERT: &'static str = "INSERT INTO `widget_state` (
            `session_id`,
            `widget_id`,
            `widget_type`,
            `value`,
            `properties`,
            `version`,
            `last_updated`
            ) VALUES (?,?,?,?,?,?,?)
            ON CONFLICT(`session_id`, `widget_id`) DO UPDATE SET
            `widget_type` = excluded.`widget_type`,
            `value` = excluded.`value`,
            `properties` = excluded.`properties`,
            `version` = excluded.`version`,
            `last_updated` = excluded.`last_updated`
            WHERE excluded.`version` > `widget_state`.`version`";

    // the upsert only fires for a strictly newer version
    async fn upsert<'c, E: Executor<'c, Database = Sqlite>>(
        tx: E,
        state: &PersistedWidget,
    ) -> Result<bool> {
        let value = serde_json::to_string(&state.value).map_err(LiveError::SerdeJsonError)?;
        let properties =
            serde_json::to_string(&state.properties).map_err(LiveError::SerdeJsonError)?;
        let res = sqlx::query::<Sqlite>(Self::UPSERT)
            .bind(state.session_id.as_str())
            .bind(state.widget_id.as_str())
            .bind(state.widget_type.as_str())
            .bind(value)
            .bind(properties)
            .bind(state.version as i64)
            .bind(state.last_updated.timestamp_millis())
            .execute(tx)
            .await
            .map_err(LiveError::DBError)?;
        Ok(res.rows_affected() > 0)
    }
}

#[async_trait]
impl WidgetStateRepository for RdbWidgetStateRepository {
    async fn save(&self, state: &PersistedWidget) -> Result<bool> {
        let stored = Self::upsert(&self.pool, state).await?;
        tracing::debug!(
            session_id = %state.session_id,
            widget_id = %state.widget_id,
            version = state.version,
            stored,
            "save widget state to sqlite"
        );
        Ok(stored)
    }

    async fn load(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
    ) -> Result<Option<PersistedWidget>> {
        let row = sqlx::query_as::<_, WidgetStateRow>(
            "SELECT * FROM `widget_state` WHERE `session_id` = ? AND `widget_id` = ?",
        )
        .bind(session_id.as_str())
        .bind(widget_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(LiveError::DBError)?;
        row.map(|r| r.to_state()).transpose()
    }

    async fn delete(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<bool> {
        let res = sqlx::query("DELETE FROM `widget_state` WHERE `session_id` = ? AND `widget_id` = ?")
            .bind(session_id.as_str())
            .bind(widget_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(LiveError::DBError)?;
        Ok(res.rows_affected() > 0)
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<u64> {
        let res = sqlx::query("DELETE FROM `widget_state` WHERE `session_id` = ?")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(LiveError::DBError)?;
        Ok(res.rows_affected())
    }

    async fn batch_save(&self, states: &[PersistedWidget]) -> Result<Vec<bool>> {
        let mut tx = self.pool.begin().await.map_err(LiveError::DBError)?;
        let mut results = Vec::with_capacity(states.len());
        for state in states {
            results.push(Self::upsert(&mut *tx, state).await?);
        }
        tx.commit().await.map_err(LiveError::DBError)?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::persistence::test_support::{assert_versioned_store, slider_state};
    use crate::infra::resource::setup_sqlite_pool;
    use livecell_base::widget::WidgetValue;

    #[tokio::test]
    async fn test_versioned_store() {
        let pool = setup_sqlite_pool("sqlite::memory:").await.unwrap();
        let repo = RdbWidgetStateRepository::new(pool);
        assert_versioned_store(&repo, "sess-rdb").await;
    }

    #[tokio::test]
    async fn test_batch_save_in_one_transaction() {
        let pool = setup_sqlite_pool("sqlite::memory:").await.unwrap();
        let repo = RdbWidgetStateRepository::new(pool);
        repo.save(&slider_state("s", "w1", 5.0, 3)).await.unwrap();
        let results = repo
            .batch_save(&[
                slider_state("s", "w1", 6.0, 2),
                slider_state("s", "w2", 7.0, 1),
            ])
            .await
            .unwrap();
        assert_eq!(results, vec![false, true]);
        let w1 = repo.load(&"s".into(), &"w1".into()).await.unwrap().unwrap();
        assert_eq!(w1.value, WidgetValue::Number(5.0));
        assert_eq!(w1.version, 3);
        assert_eq!(w1.properties.max, Some(10.0));
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("state.sqlite3").display());
        {
            let repo = RdbWidgetStateRepository::new(setup_sqlite_pool(&url).await.unwrap());
            repo.save(&slider_state("s", "w1", 2.0, 1)).await.unwrap();
        }
        let repo = RdbWidgetStateRepository::new(setup_sqlite_pool(&url).await.unwrap());
        let loaded = repo.load(&"s".into(), &"w1".into()).await.unwrap().unwrap();
        assert_eq!(loaded.value, WidgetValue::Number(2.0));
    }
}
