//! Redis cache for Daraja access tokens
//!
//! Every read and write degrades to a miss when Redis is unavailable; callers never fail
//! because of the cache.

pub mod cache;
pub mod error;
pub mod keys;

pub use cache::RedisCache;
pub use error::{CacheError, CacheResult};

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::{error, info, warn};

/// Redis connection pool type alias
pub type RedisPool = Pool<RedisConnectionManager>;

/// Redis pool settings
#[derive(Debug, Clone)]
pub struct CachePoolConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub min_idle: u32,
    pub connection_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl Default for CachePoolConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 20,
            min_idle: 5,
            connection_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&crate::config::CacheConfig> for CachePoolConfig {
    fn from(config: &crate::config::CacheConfig) -> Self {
        Self {
            redis_url: config.redis_url.clone(),
            max_connections: config.max_connections,
            min_idle: config.max_connections.min(5),
            ..Self::default()
        }
    }
}

/// Build the Redis pool. A failed initial PING is logged, not fatal.
pub async fn init_cache_pool(config: CachePoolConfig) -> Result<RedisPool, CacheError> {
    info!(
        max_connections = config.max_connections,
        "Initializing Redis cache pool"
    );

    let client = Client::open(config.redis_url.clone()).map_err(|e| {
        error!(error = %e, "Invalid Redis URL");
        CacheError::ConnectionError(e.to_string())
    })?;
    let manager = RedisConnectionManager::new(client.get_connection_info().clone()).map_err(|e| {
        error!(error = %e, "Failed to create Redis connection manager");
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to build Redis connection pool");
            CacheError::ConnectionError(e.to_string())
        })?;

    if let Err(e) = ping(&pool).await {
        warn!(error = %e, "Redis unreachable at startup, Daraja tokens will not be cached");
    }

    Ok(pool)
}

async fn ping(pool: &RedisPool) -> Result<(), CacheError> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}

pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
    ping(pool).await
}

/// Get pool statistics
#[derive(Debug)]
pub struct CacheStats {
    pub connections: u32,
    pub idle_connections: u32,
    pub connections_in_use: u32,
}

pub fn get_cache_stats(pool: &RedisPool) -> CacheStats {
    CacheStats {
        connections: pool.state().connections as u32,
        idle_connections: pool.state().idle_connections as u32,
        connections_in_use: (pool.state().connections - pool.state().idle_connections) as u32,
    }
}
