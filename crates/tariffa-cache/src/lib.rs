//! Redis catalog cache for Tariffa
//!
//! Rates, plans and services are read on every rated event but change
//! rarely. `RedisCache` keeps serialized copies in Redis behind the
//! `CacheService` trait from tariffa-core; the rating service reads through
//! it and treats any cache failure as a miss.
//!
//! # Example
//!
//! ```no_run
//! use tariffa_cache::RedisCache;
//! use tariffa_core::traits::CacheService;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cache = RedisCache::new("redis://127.0.0.1:6379").await?;
//!     cache.set("rate:LOCAL", &"cached", 60).await?;
//!     let value: Option<String> = cache.get("rate:LOCAL").await?;
//!     assert_eq!(value, Some("cached".to_string()));
//!     Ok(())
//! }
//! ```

pub mod keys;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError};
use serde::{de::DeserializeOwned, Serialize};
use tariffa_core::config::RedisConfig;
use tariffa_core::error::AppError;
use tariffa_core::traits::CacheService;
use tracing::{debug, error, info, warn};

/// Redis cache backed by a multiplexed `ConnectionManager`
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
    ttl_secs: u64,
}

impl RedisCache {
    /// Connect to Redis
    ///
    /// # Errors
    ///
    /// Returns `AppError::CacheConnection` if the URL is invalid or the
    /// connection cannot be established
    pub async fn new(url: &str) -> Result<Self, AppError> {
        debug!("Connecting to Redis at {}", url);

        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::CacheConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::CacheConnection(format!("Connection failed: {}", e))
        })?;

        info!("Redis connection established");
        Ok(Self {
            manager,
            ttl_secs: keys::RATE_TTL_SECS,
        })
    }

    /// Connect using the redis section of the application configuration
    pub async fn from_config(config: &RedisConfig) -> Result<Self, AppError> {
        let mut cache = Self::new(&config.url).await?;
        cache.ttl_secs = config.default_ttl_secs;
        Ok(cache)
    }

    /// TTL applied to catalog entries
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    /// Ping the Redis server to check connectivity
    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    /// Drop a cached rate after its definition changed
    pub async fn invalidate_rate(&self, rate_key: &str) -> Result<bool, AppError> {
        self.delete(&keys::rate_key(rate_key)).await
    }

    #[cfg(test)]
    async fn flush_db(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_redis_error)?;
        Ok(())
    }

    /// Convert RedisError to AppError
    fn map_redis_error(err: RedisError) -> AppError {
        match err.kind() {
            redis::ErrorKind::IoError => {
                error!("Redis I/O error: {}", err);
                AppError::CacheConnection(format!("I/O error: {}", err))
            }
            redis::ErrorKind::TypeError => {
                warn!("Redis type error: {}", err);
                AppError::Cache(format!("Type mismatch: {}", err))
            }
            _ => {
                error!("Redis error: {}", err);
                AppError::Cache(err.to_string())
            }
        }
    }
}

#[async_trait]
impl CacheService for RedisCache {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AppError> {
        let mut conn = self.manager.clone();

        let result: Option<String> = conn.get(key).await.map_err(Self::map_redis_error)?;

        match result {
            Some(json) => {
                let value = serde_json::from_str::<T>(&json).map_err(|e| {
                    warn!("Discarding undecodable cache entry {}: {}", key, e);
                    AppError::Serialization(format!("Deserialization failed: {}", e))
                })?;
                debug!("Cache HIT: {}", key);
                Ok(Some(value))
            }
            None => {
                debug!("Cache MISS: {}", key);
                Ok(None)
            }
        }
    }

    async fn set<T: Serialize + Send + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> Result<(), AppError> {
        debug!("SET {} (TTL: {}s)", key, ttl_secs);
        let mut conn = self.manager.clone();

        let json = serde_json::to_string(value)?;

        let _: () = conn
            .set_ex(key, json, ttl_secs)
            .await
            .map_err(Self::map_redis_error)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let deleted: i32 = conn.del(key).await.map_err(Self::map_redis_error)?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        let mut conn = self.manager.clone();
        let exists: bool = conn.exists(key).await.map_err(Self::map_redis_error)?;
        Ok(exists)
    }
}
