use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::distributed::DistributedCache;
use super::CacheError;

/// KEYS: entry, its tag index. ARGV: payload, ttl ms, tag set keys.
/// Tag sets live at least as long as their newest member.
const SET_SCRIPT: &str = r#"
for _, tag in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  redis.call('SREM', tag, KEYS[1])
end
redis.call('DEL', KEYS[2])
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
local ttl = tonumber(ARGV[2])
for i = 3, #ARGV do
  redis.call('SADD', ARGV[i], KEYS[1])
  redis.call('SADD', KEYS[2], ARGV[i])
  if redis.call('PTTL', ARGV[i]) < ttl then
    redis.call('PEXPIRE', ARGV[i], ttl)
  end
end
if #ARGV > 2 then
  redis.call('PEXPIRE', KEYS[2], ttl)
end
return 1
"#;

/// KEYS: entry, its tag index. Returns the number of entries deleted.
const DELETE_SCRIPT: &str = r#"
for _, tag in ipairs(redis.call('SMEMBERS', KEYS[2])) do
  redis.call('SREM', tag, KEYS[1])
end
redis.call('DEL', KEYS[2])
return redis.call('DEL', KEYS[1])
"#;

/// KEYS: tag set. ARGV: tag index prefix. Returns the live keys deleted.
const INVALIDATE_SCRIPT: &str = r#"
local removed = {}
for _, key in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  local index = ARGV[1] .. key
  for _, tag in ipairs(redis.call('SMEMBERS', index)) do
    redis.call('SREM', tag, key)
  end
  redis.call('DEL', index)
  if redis.call('DEL', key) == 1 then
    table.insert(removed, key)
  end
end
redis.call('DEL', KEYS[1])
return removed
"#;

const SCAN_BATCH: usize = 500;

/// Redis tier. Tag membership lives in `{namespace}:tag:{tag}` sets, each
/// entry remembers its tags in `{namespace}:tags-of:{key}` so overwrites
/// and deletes leave no stale membership.
#[derive(Clone)]
pub struct RedisCache {
    connection: Arc<Mutex<ConnectionManager>>,
    namespace: String,
}

impl RedisCache {
    pub async fn new(redis_url: &str, namespace: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|err| CacheError::Unavailable(format!("Invalid Redis URL: {}", err)))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|err| CacheError::Unavailable(format!("Redis unavailable: {}", err)))?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
            namespace: namespace.to_string(),
        })
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.namespace, tag)
    }

    fn index_prefix(&self) -> String {
        format!("{}:tags-of:", self.namespace)
    }

    fn index_key(&self, key: &str) -> String {
        format!("{}{}", self.index_prefix(), key)
    }
}

#[async_trait]
impl DistributedCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.connection.lock().await;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.filter(|payload| !payload.is_empty()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String]) -> Result<(), CacheError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let script = redis::Script::new(SET_SCRIPT);
        let mut invocation = script.key(key);
        invocation.key(self.index_key(key)).arg(value).arg(ttl_ms);
        for tag in tags {
            invocation.arg(self.tag_key(tag));
        }

        let mut conn = self.connection.lock().await;
        let _: i64 = invocation.invoke_async(&mut *conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection.lock().await;
        let removed: i64 = redis::Script::new(DELETE_SCRIPT)
            .key(key)
            .key(self.index_key(key))
            .invoke_async(&mut *conn)
            .await?;
        Ok(removed > 0)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, CacheError> {
        let mut conn = self.connection.lock().await;
        // -2: no such key, -1: no expiry
        let millis: i64 = conn.pttl(key).await?;
        Ok(match millis {
            m if m > 0 => Some(Duration::from_millis(m as u64)),
            -1 => Some(Duration::MAX),
            _ => None,
        })
    }

    async fn invalidate_tags(&self, tags: &[String]) -> Result<Vec<String>, CacheError> {
        let script = redis::Script::new(INVALIDATE_SCRIPT);
        let index_prefix = self.index_prefix();
        let mut conn = self.connection.lock().await;
        let mut removed = Vec::new();

        for tag in tags {
            let deleted: Vec<String> = script
                .key(self.tag_key(tag))
                .arg(&index_prefix)
                .invoke_async(&mut *conn)
                .await?;
            tracing::debug!(tag = %tag, deleted = deleted.len(), "Redis tag invalidated");
            removed.extend(deleted);
        }

        Ok(removed)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let script = redis::Script::new(DELETE_SCRIPT);
        let pattern = format!("{}*", prefix);
        let mut conn = self.connection.lock().await;
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut *conn)
                .await?;
            for key in keys {
                let removed: i64 = script
                    .key(&key)
                    .key(self.index_key(&key))
                    .invoke_async(&mut *conn)
                    .await?;
                deleted += removed.max(0) as usize;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.connection.lock().await;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
