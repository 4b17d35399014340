//! Thin Redis wrapper used for short-lived values such as Daraja access tokens

use super::error::{CacheError, CacheResult};
use super::keys::daraja::TokenKey;
use super::RedisPool;
use crate::payments::AccessTokenCache;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct RedisCache {
    pool: RedisPool,
}

impl RedisCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    pub async fn get_string(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    pub async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let seconds = ttl.as_secs();
        if seconds == 0 {
            return Err(CacheError::OperationError(format!(
                "refusing to cache {} without a TTL",
                key
            )));
        }

        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(seconds)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AccessTokenCache for RedisCache {
    async fn get_token(&self, credential_id: Uuid) -> Option<String> {
        let key = TokenKey::new(credential_id).to_string();
        match self.get_string(&key).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Daraja token cache read failed, fetching fresh token");
                None
            }
        }
    }

    async fn put_token(&self, credential_id: Uuid, token: &str, ttl: Duration) {
        let key = TokenKey::new(credential_id).to_string();
        match self.set_string(&key, token, ttl).await {
            Ok(()) => debug!(ttl_secs = ttl.as_secs(), "Daraja token cached"),
            Err(e) => warn!(error = %e, "Daraja token cache write failed"),
        }
    }
}
