//! Graceful-degradation cache: always misses, never stores, and its
//! mutex always succeeds. Correct for single-process deployments only.

use std::time::Duration;

use async_trait::async_trait;

use super::{CacheService, NamedMutex};

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

struct NoopMutex;

#[async_trait]
impl NamedMutex for NoopMutex {
    async fn lock(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn unlock(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CacheService for NoopCache {
    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn new_mutex(&self, _name: &str) -> Box<dyn NamedMutex> {
        Box::new(NoopMutex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn everything_misses() {
        let cache = NoopCache;
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
        cache.delete("k").await.unwrap();
        cache.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn mutex_always_succeeds() {
        let cache = NoopCache;
        let mut m = cache.new_mutex("anything");
        m.lock().await.unwrap();
        m.unlock().await.unwrap();
    }
}
