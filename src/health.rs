//! Health check module
//! Reports on Postgres and, when configured, the Redis token cache

use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::cache::RedisCache;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// The token cache is down; Daraja tokens are fetched on every request
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Disabled,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    /// Database failures make the service unhealthy, cache failures only degrade it
    fn settle(&mut self) {
        let down = |name: &str| {
            self.checks
                .get(name)
                .is_some_and(|c| c.status == ComponentState::Down)
        };
        self.status = if down("database") {
            HealthState::Unhealthy
        } else if down("cache") {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn disabled() -> Self {
        Self {
            status: ComponentState::Disabled,
            response_time_ms: None,
            details: None,
        }
    }
}

/// Health checker for the application
#[derive(Clone)]
pub struct HealthChecker {
    db_pool: sqlx::PgPool,
    cache: Option<RedisCache>,
}

impl HealthChecker {
    pub fn new(db_pool: sqlx::PgPool, cache: Option<RedisCache>) -> Self {
        Self { db_pool, cache }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        let database = match timeout(CHECK_TIMEOUT, check_database_health(&self.db_pool)).await {
            Ok(Ok(response_time)) => {
                let stats = crate::database::get_pool_stats(&self.db_pool);
                ComponentHealth::up(Some(response_time))
                    .with_details(format!("{} connections, {} idle", stats.size, stats.num_idle))
            }
            Ok(Err(e)) => {
                error!("Database health check failed: {}", e);
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                error!("Database health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        };
        health_status.checks.insert("database".to_string(), database);

        let cache = match &self.cache {
            None => ComponentHealth::disabled(),
            Some(cache) => match timeout(CHECK_TIMEOUT, check_cache_health(cache)).await {
                Ok(Ok(response_time)) => {
                    let stats = crate::cache::get_cache_stats(cache.pool());
                    ComponentHealth::up(Some(response_time)).with_details(format!(
                        "{} connections, {} in use",
                        stats.connections, stats.connections_in_use
                    ))
                }
                Ok(Err(e)) => {
                    warn!("Cache health check failed: {}", e);
                    ComponentHealth::down(Some(e.to_string()))
                }
                Err(_) => {
                    warn!("Cache health check timed out");
                    ComponentHealth::down(Some("Timeout".to_string()))
                }
            },
        };
        health_status.checks.insert("cache".to_string(), cache);

        health_status.settle();
        info!(status = ?health_status.status, "Health check completed");
        health_status
    }
}

pub async fn check_database_health(
    pool: &sqlx::PgPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    crate::database::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}

pub async fn check_cache_health(
    cache: &RedisCache,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    crate::cache::health_check(cache.pool()).await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(health_status.is_healthy());
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn cache_failure_only_degrades() {
        let mut status = HealthStatus::new();
        status
            .checks
            .insert("database".to_string(), ComponentHealth::up(Some(3)));
        status.checks.insert(
            "cache".to_string(),
            ComponentHealth::down(Some("connection refused".to_string())),
        );
        status.settle();
        assert_eq!(status.status, HealthState::Degraded);

        status.checks.insert(
            "database".to_string(),
            ComponentHealth::down(Some("Timeout".to_string())),
        );
        status.settle();
        assert_eq!(status.status, HealthState::Unhealthy);
    }

    #[test]
    fn disabled_cache_is_healthy() {
        let mut status = HealthStatus::new();
        status
            .checks
            .insert("database".to_string(), ComponentHealth::up(Some(1)));
        status
            .checks
            .insert("cache".to_string(), ComponentHealth::disabled());
        status.settle();
        assert!(status.is_healthy());
    }
}
