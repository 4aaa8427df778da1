use super::execution::ExecutionConfig;
use super::persistence::PersistenceConfig;
use anyhow::Result;
use deadpool_redis::{Config as RedisPoolConfig, Pool as RedisPool, Runtime};
use livecell_base::error::LiveError;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

const SQLITE_SCHEMA: &str = include_str!("../../sql/sqlite/001_schema.sql");
const SQLITE_MAX_CONNECTIONS: u32 = 8;

pub fn load_persistence_config_from_env() -> Result<PersistenceConfig> {
    envy::prefixed("PERSISTENCE_")
        .from_env::<PersistenceConfig>()
        .map_err(|e| {
            LiveError::RuntimeError(format!("cannot read persistence config from env: {:?}", e))
                .into()
        })
}

pub fn load_execution_config_from_env() -> Result<ExecutionConfig> {
    envy::prefixed("EXECUTION_")
        .from_env::<ExecutionConfig>()
        .map_err(|e| {
            LiveError::RuntimeError(format!("cannot read execution config from env: {:?}", e))
                .into()
        })
}

/// Open the sqlite pool and create the schema if missing.
///
/// An in-memory database lives only as long as its connection, so it is
/// pinned to a single connection that is never recycled.
pub async fn setup_sqlite_pool(url: &str) -> Result<SqlitePool> {
    let options = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(SQLITE_MAX_CONNECTIONS)
    };
    let pool = options.connect(url).await.map_err(LiveError::DBError)?;
    sqlx::raw_sql(SQLITE_SCHEMA)
        .execute(&pool)
        .await
        .map_err(LiveError::DBError)?;
    tracing::debug!(url, "sqlite pool ready");
    Ok(pool)
}

pub fn setup_redis_pool(url: &str) -> Result<RedisPool> {
    RedisPoolConfig::from_url(url)
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| {
            LiveError::RuntimeError(format!("cannot create redis pool for {}: {:?}", url, e))
                .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_schema_is_created() {
        let pool = setup_sqlite_pool("sqlite::memory:").await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM widget_state")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_redis_pool_rejects_bad_url() {
        assert!(setup_redis_pool("not a url").is_err());
    }
}
