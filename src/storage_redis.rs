//! Redis-backed key-value store, behind the `redis` feature.

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::StoreError;
use crate::storage::KvStore;

pub struct RedisKvStore {
    client: redis::Client,
}

impl RedisKvStore {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError(format!("redis client: {e}")))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError(format!("redis connect: {e}")))
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| StoreError(format!("redis get: {e}")))?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(key, value, ttl_seconds)
            .await
            .map_err(|e| StoreError(format!("redis setex: {e}")))?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let count: i64 = conn
            .incr(key, 1)
            .await
            .map_err(|e| StoreError(format!("redis incr: {e}")))?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: bool = conn
            .expire(key, ttl_seconds as i64)
            .await
            .map_err(|e| StoreError(format!("redis expire: {e}")))?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn().await?;
        let ttl: i64 = conn
            .ttl(key)
            .await
            .map_err(|e| StoreError(format!("redis ttl: {e}")))?;
        Ok(ttl)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| StoreError(format!("redis del: {e}")))?;
        Ok(())
    }
}
