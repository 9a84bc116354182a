use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use super::{StorageBackend, StorageError};

/// Redis storage backend. The connection is created lazily on first use and
/// dropped on `close`, so constructing the backend never touches the network.
/// Values are stored as JSON strings.
pub struct RedisStorage {
    url: String,
    conn: Mutex<Option<ConnectionManager>>,
}

impl RedisStorage {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            conn: Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, StorageError> {
        let mut guard = self.conn.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }

        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        debug!(url = %self.url, "redis connection established");

        *guard = Some(manager.clone());
        Ok(manager)
    }

    fn encode(value: &Value) -> Result<String, StorageError> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(raw: Option<String>) -> Result<Option<Value>, StorageError> {
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::decode(raw)
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let encoded = Self::encode(&value)?;
        match ttl {
            Some(ttl) => {
                let _: () = conn
                    .set_ex(key, encoded, ttl.as_secs())
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
            }
            None => {
                let _: () = conn
                    .set(key, encoded)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .del(key)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        conn.exists(key)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.connection().await?;
        conn.keys(pattern)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>, StorageError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .hget(key, field)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::decode(raw)
    }

    async fn hset(&self, key: &str, field: &str, value: Value) -> Result<(), StorageError> {
        let mut conn = self.connection().await?;
        let encoded = Self::encode(&value)?;
        let _: () = conn
            .hset(key, field, encoded)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Value>, StorageError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut decoded = HashMap::with_capacity(raw.len());
        for (field, value) in raw {
            decoded.insert(field, serde_json::from_str(&value)?);
        }
        Ok(decoded)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .hdel(key, field)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.conn.lock().await.take();
        Ok(())
    }
}
