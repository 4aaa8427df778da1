use super::{PersistedWidget, WidgetStateRepository};
use anyhow::Result;
use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, Script};
use deadpool_redis::Pool as RedisPool;
use debug_stub_derive::DebugStub;
use livecell_base::error::LiveError;
use livecell_base::widget::{SessionId, WidgetId};
use once_cell::sync::Lazy;

// KEYS[1]=hash key, ARGV: widget id, json, version, ttl seconds
static SAVE_IF_NEWER: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current then
  local ok, decoded = pcall(cjson.decode, current)
  if ok and type(decoded) == 'table' then
    local stored = tonumber(decoded['version'])
    if stored and stored >= tonumber(ARGV[3]) then
      return 0
    end
  end
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
end
return 1
"#,
    )
});

/// Durable-remote strategy: one redis hash per session, one field per widget.
#[derive(Clone, DebugStub)]
pub struct RedisWidgetStateRepository {
    #[debug_stub = "RedisPool"]
    redis_pool: RedisPool,
    ttl_sec: u64,
}

impl RedisWidgetStateRepository {
    const KEY_PREFIX: &'static str = "livecell:widget_state:";

    pub fn new(redis_pool: RedisPool, ttl_sec: u64) -> Self {
        Self {
            redis_pool,
            ttl_sec,
        }
    }

    fn session_key(session_id: &SessionId) -> String {
        format!("{}{}", Self::KEY_PREFIX, session_id)
    }

    fn deserialize(json: &str) -> Result<PersistedWidget> {
        serde_json::from_str(json).map_err(|e| LiveError::SerdeJsonError(e).into())
    }
}

#[async_trait]
impl WidgetStateRepository for RedisWidgetStateRepository {
    async fn save(&self, state: &PersistedWidget) -> Result<bool> {
        let json = serde_json::to_string(state).map_err(LiveError::SerdeJsonError)?;
        let mut conn = self.redis_pool.get().await?;
        let stored: i32 = SAVE_IF_NEWER
            .key(Self::session_key(&state.session_id))
            .arg(state.widget_id.as_str())
            .arg(json)
            .arg(state.version)
            .arg(self.ttl_sec)
            .invoke_async(&mut conn)
            .await
            .map_err(LiveError::RedisError)?;
        tracing::debug!(
            session_id = %state.session_id,
            widget_id = %state.widget_id,
            version = state.version,
            stored = stored > 0,
            "save widget state to redis"
        );
        Ok(stored > 0)
    }

    async fn load(
        &self,
        session_id: &SessionId,
        widget_id: &WidgetId,
    ) -> Result<Option<PersistedWidget>> {
        let data: Option<String> = self
            .redis_pool
            .get()
            .await?
            .hget(Self::session_key(session_id), widget_id.as_str())
            .await
            .map_err(LiveError::RedisError)?;
        data.map(|json| Self::deserialize(&json)).transpose()
    }

    async fn delete(&self, session_id: &SessionId, widget_id: &WidgetId) -> Result<bool> {
        let deleted: i32 = self
            .redis_pool
            .get()
            .await?
            .hdel(Self::session_key(session_id), widget_id.as_str())
            .await
            .map_err(LiveError::RedisError)?;
        Ok(deleted > 0)
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<u64> {
        let key = Self::session_key(session_id);
        let mut conn = self.redis_pool.get().await?;
        let count: u64 = conn.hlen(&key).await.map_err(LiveError::RedisError)?;
        let _: i32 = conn.del(&key).await.map_err(LiveError::RedisError)?;
        tracing::debug!(session_id = %session_id, count, "delete session widget states from redis");
        Ok(count)
    }

    async fn batch_load(
        &self,
        session_id: &SessionId,
        widget_ids: &[WidgetId],
    ) -> Result<Vec<PersistedWidget>> {
        if widget_ids.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.redis_pool.get().await?;
        let fields: Vec<&str> = widget_ids.iter().map(|id| id.as_str()).collect();
        let found: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(Self::session_key(session_id))
            .arg(fields)
            .query_async(&mut conn)
            .await
            .map_err(LiveError::RedisError)?;
        found
            .into_iter()
            .flatten()
            .map(|json| Self::deserialize(&json))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::persistence::test_support::assert_versioned_store;
    use crate::infra::resource::setup_redis_pool;
    use crate::infra::test::REDIS_CONFIG;

    #[tokio::test]
    #[ignore = "requires a running redis (REDIS_URL)"]
    async fn test_versioned_store() {
        let pool = setup_redis_pool(&REDIS_CONFIG.redis_url).unwrap();
        let repo = RedisWidgetStateRepository::new(pool, REDIS_CONFIG.redis_ttl_sec);
        let session = SessionId::random();
        repo.delete_session(&session).await.unwrap();
        assert_versioned_store(&repo, session.as_str()).await;
    }
}
