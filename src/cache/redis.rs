//! Redis-backed cache service.
//!
//! Connections are multiplexed and established lazily; a failed
//! connection is dropped so the next call reconnects. The named mutex
//! is a `SET NX PX` lease with a per-holder token; release goes
//! through a token-checked Lua script so only the acquirer can unlock.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CacheService, NamedMutex};

/// Lease applied to mutex keys so a crashed holder cannot wedge the
/// name forever.
const MUTEX_LEASE: Duration = Duration::from_secs(30);
/// How long `lock` keeps retrying before giving up.
const MUTEX_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const MUTEX_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

pub struct RedisCache {
    client: redis::Client,
    key_prefix: String,
    connection: Arc<Mutex<Option<redis::aio::MultiplexedConnection>>>,
}

impl RedisCache {
    pub fn new(url: &str, key_prefix: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url: {url}"))?;
        Ok(Self {
            client,
            key_prefix: key_prefix.to_string(),
            connection: Arc::new(Mutex::new(None)),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> anyhow::Result<redis::aio::MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis")?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn drop_connection(&self) {
        *self.connection.lock().await = None;
    }

    async fn run<T: redis::FromRedisValue>(&self, cmd: redis::Cmd) -> anyhow::Result<T> {
        let mut conn = self.connection().await?;
        match cmd.query_async(&mut conn).await {
            Ok(v) => Ok(v),
            Err(e) => {
                // Reconnect on the next call.
                self.drop_connection().await;
                Err(e).context("redis command failed")
            }
        }
    }
}

#[async_trait]
impl CacheService for RedisCache {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64);
        let _: () = self.run(cmd).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.full_key(key));
        self.run(cmd).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.full_key(key));
        let _: i64 = self.run(cmd).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(self.full_key(key));
        let n: i64 = self.run(cmd).await?;
        Ok(n > 0)
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        let cmd = redis::cmd("PING");
        let _: String = self.run(cmd).await?;
        Ok(())
    }

    fn new_mutex(&self, name: &str) -> Box<dyn NamedMutex> {
        Box::new(RedisMutex {
            key: format!("{}:mutex:{}", self.key_prefix, name),
            token: uuid::Uuid::new_v4().to_string(),
            held: false,
            client: self.client.clone(),
        })
    }
}

/// A `SET NX` lease with a fencing token.
struct RedisMutex {
    key: String,
    token: String,
    held: bool,
    client: redis::Client,
}

impl RedisMutex {
    async fn try_acquire(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> anyhow::Result<bool> {
        let outcome: Option<String> = redis::cmd("SET")
            .arg(&self.key)
            .arg(&self.token)
            .arg("NX")
            .arg("PX")
            .arg(MUTEX_LEASE.as_millis() as u64)
            .query_async(conn)
            .await
            .context("mutex SET NX failed")?;
        Ok(outcome.is_some())
    }
}

#[async_trait]
impl NamedMutex for RedisMutex {
    async fn lock(&mut self) -> anyhow::Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis for mutex")?;
        let deadline = tokio::time::Instant::now() + MUTEX_ACQUIRE_TIMEOUT;
        loop {
            if self.try_acquire(&mut conn).await? {
                self.held = true;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("timed out acquiring mutex {}", self.key);
            }
            tokio::time::sleep(MUTEX_RETRY_INTERVAL).await;
        }
    }

    async fn unlock(&mut self) -> anyhow::Result<()> {
        if !self.held {
            anyhow::bail!("unlock without holding {}", self.key);
        }
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis for mutex")?;
        let released: i64 = redis::cmd("EVAL")
            .arg(UNLOCK_SCRIPT)
            .arg(1)
            .arg(&self.key)
            .arg(&self.token)
            .query_async(&mut conn)
            .await
            .context("mutex release failed")?;
        self.held = false;
        if released == 0 {
            anyhow::bail!("lease on {} expired before release", self.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_url() {
        assert!(RedisCache::new("not-a-url", "jan").is_err());
    }

    #[test]
    fn keys_are_prefixed() {
        let cache = RedisCache::new("redis://127.0.0.1:6379", "jan").unwrap();
        assert_eq!(cache.full_key("models:jan"), "jan:models:jan");
    }

    #[tokio::test]
    async fn unlock_without_lock_fails() {
        let cache = RedisCache::new("redis://127.0.0.1:6379", "jan").unwrap();
        let mut m = cache.new_mutex("registry:refresh");
        assert!(m.unlock().await.is_err());
    }
}
