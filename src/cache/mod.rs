//! String KV cache with TTL, distributed mutual exclusion, and a
//! stale-tolerant fallback loader.
//!
//! Two implementations exist: [`redis::RedisCache`] for real
//! deployments and [`noop::NoopCache`] for cacheless ones. Callers
//! must behave correctly with either: cache failures are logged and
//! reported as misses, never propagated.

pub mod noop;
pub mod redis;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

pub use noop::NoopCache;
pub use redis::RedisCache;

/// TTL applied to the stale sibling copy a fallback load leaves behind.
const STALE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// A named cross-process mutex. Lock holders are fenced: only the
/// acquirer may release.
#[async_trait]
pub trait NamedMutex: Send {
    async fn lock(&mut self) -> anyhow::Result<()>;
    async fn unlock(&mut self) -> anyhow::Result<()>;
}

/// String KV with per-entry TTL.
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    async fn health_check(&self) -> anyhow::Result<()>;
    /// Create a named cross-process mutex scoped to this cache.
    fn new_mutex(&self, name: &str) -> Box<dyn NamedMutex>;
}

/// Result of [`get_with_fallback`]: the value plus an advisory flag
/// marking it as a stale copy served after a loader failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackValue {
    pub value: String,
    pub stale: bool,
}

impl FallbackValue {
    fn fresh(value: String) -> Self {
        Self {
            value,
            stale: false,
        }
    }
}

/// Return the cached value under `key`, or invoke `loader` once per
/// key (serialised through the cache's named mutex) and store the
/// result under `ttl`.
///
/// When `stale_on_error` is set, a loader failure falls back to the
/// stale sibling copy left behind by an earlier successful load.
/// Cache infrastructure errors are logged and treated as misses.
pub async fn get_with_fallback<F, Fut>(
    cache: &dyn CacheService,
    key: &str,
    ttl: Duration,
    stale_on_error: bool,
    loader: F,
) -> anyhow::Result<FallbackValue>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<String>>,
{
    match cache.get(key).await {
        Ok(Some(v)) => return Ok(FallbackValue::fresh(v)),
        Ok(None) => {}
        Err(e) => warn!(key, error = %e, "cache get failed, treating as miss"),
    }

    let mut mutex = cache.new_mutex(&format!("{key}:refill"));
    let locked = match mutex.lock().await {
        Ok(()) => true,
        Err(e) => {
            warn!(key, error = %e, "cache mutex lock failed, loading without it");
            false
        }
    };

    // Another holder may have refilled while we waited on the mutex.
    if locked {
        match cache.get(key).await {
            Ok(Some(v)) => {
                if let Err(e) = mutex.unlock().await {
                    warn!(key, error = %e, "cache mutex unlock failed");
                }
                return Ok(FallbackValue::fresh(v));
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "cache re-check failed"),
        }
    }

    let loaded = loader().await;

    let outcome = match loaded {
        Ok(value) => {
            if let Err(e) = cache.set(key, &value, ttl).await {
                warn!(key, error = %e, "cache set failed");
            }
            if let Err(e) = cache.set(&stale_key(key), &value, STALE_TTL).await {
                warn!(key, error = %e, "stale copy set failed");
            }
            Ok(FallbackValue::fresh(value))
        }
        Err(load_err) => {
            if stale_on_error {
                match cache.get(&stale_key(key)).await {
                    Ok(Some(v)) => {
                        warn!(key, error = %load_err, "loader failed, serving stale value");
                        Ok(FallbackValue {
                            value: v,
                            stale: true,
                        })
                    }
                    Ok(None) => Err(load_err),
                    Err(e) => {
                        warn!(key, error = %e, "stale lookup failed");
                        Err(load_err)
                    }
                }
            } else {
                Err(load_err)
            }
        }
    };

    if locked {
        if let Err(e) = mutex.unlock().await {
            warn!(key, error = %e, "cache mutex unlock failed");
        }
    }

    outcome
}

fn stale_key(key: &str) -> String {
    format!("{key}:stale")
}
