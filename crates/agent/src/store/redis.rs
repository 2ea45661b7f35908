use super::StateCache;
use anyhow::Result;
use async_trait::async_trait;
use tandem_storage::RedisService;

/// Redis 缓存实现
#[derive(Clone)]
pub struct RedisStateCache {
    service: RedisService,
}

impl RedisStateCache {
    pub fn new(service: RedisService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl StateCache for RedisStateCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.service.get_bytes(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl_secs: u64) -> Result<()> {
        self.service.set_bytes(key, value, Some(ttl_secs)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.service.delete(key).await
    }
}
