use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{StorageBackend, StorageError, glob_match};

/// In-process storage backend with per-key TTL.
///
/// Expired keys are lazily evicted on access and swept on `keys`. Hash keys
/// live in a separate namespace and do not expire, matching the scalar/hash
/// split of the Redis backend.
#[derive(Default)]
pub struct MemoryStorage {
    data: DashMap<String, Value>,
    expires: DashMap<String, Instant>,
    hashes: DashMap<String, HashMap<String, Value>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict the key if its TTL has passed. Returns true if it expired.
    fn evict_if_expired(&self, key: &str) -> bool {
        let expired = self
            .expires
            .get(key)
            .is_some_and(|deadline| Instant::now() > *deadline);
        if expired {
            self.data.remove(key);
            self.expires.remove(key);
        }
        expired
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expires
            .iter()
            .filter(|entry| now > *entry.value())
            .map(|entry| entry.key().clone())
            .collect();
        for key in expired {
            self.data.remove(&key);
            self.expires.remove(&key);
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        if self.evict_if_expired(key) {
            return Ok(None);
        }
        Ok(self.data.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StorageError> {
        self.data.insert(key.to_string(), value);
        match ttl {
            Some(ttl) => {
                self.expires.insert(key.to_string(), Instant::now() + ttl);
            }
            None => {
                self.expires.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let existed = self.data.remove(key).is_some();
        self.expires.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        if self.evict_if_expired(key) {
            return Ok(false);
        }
        Ok(self.data.contains_key(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        self.sweep_expired();
        Ok(self
            .data
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| pattern == "*" || glob_match(pattern, key))
            .collect())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>, StorageError> {
        Ok(self
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hset(&self, key: &str, field: &str, value: Value) -> Result<(), StorageError> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Value>, StorageError> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| hash.clone())
            .unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StorageError> {
        match self.hashes.get_mut(key) {
            Some(mut hash) => Ok(hash.remove(field).is_some()),
            None => Ok(false),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.data.clear();
        self.expires.clear();
        self.hashes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_get_set() {
        let storage = MemoryStorage::new();
        storage.set("key1", json!("value1"), None).await.unwrap();
        assert_eq!(storage.get("key1").await.unwrap(), Some(json!("value1")));
        assert_eq!(storage.get("nonexistent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete() {
        let storage = MemoryStorage::new();
        storage.set("key1", json!("value1"), None).await.unwrap();

        assert!(storage.delete("key1").await.unwrap());
        assert_eq!(storage.get("key1").await.unwrap(), None);
        assert!(!storage.delete("nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn test_exists() {
        let storage = MemoryStorage::new();
        storage.set("key1", json!(1), None).await.unwrap();
        assert!(storage.exists("key1").await.unwrap());
        assert!(!storage.exists("nonexistent").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let storage = MemoryStorage::new();
        storage.set("key1", json!(1), None).await.unwrap();
        storage.set("key2", json!(2), None).await.unwrap();
        storage.set("other", json!(3), None).await.unwrap();

        let mut all = storage.keys("*").await.unwrap();
        all.sort();
        assert_eq!(all, vec!["key1", "key2", "other"]);

        let mut matched = storage.keys("key*").await.unwrap();
        matched.sort();
        assert_eq!(matched, vec!["key1", "key2"]);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let storage = MemoryStorage::new();
        storage
            .set("short", json!("v"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        storage.set("long", json!("v"), None).await.unwrap();

        assert!(storage.exists("short").await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(storage.get("short").await.unwrap(), None);
        assert!(!storage.exists("short").await.unwrap());
        // Sweep on keys drops the expired entry as well
        assert_eq!(storage.keys("*").await.unwrap(), vec!["long"]);
    }

    #[tokio::test]
    async fn test_set_clears_previous_ttl() {
        let storage = MemoryStorage::new();
        storage
            .set("key", json!(1), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        // Re-set without TTL removes the expiry
        storage.set("key", json!(2), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(storage.get("key").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let storage = MemoryStorage::new();
        storage.hset("hash1", "field1", json!("value1")).await.unwrap();
        storage.hset("hash1", "field2", json!("value2")).await.unwrap();

        assert_eq!(
            storage.hget("hash1", "field1").await.unwrap(),
            Some(json!("value1"))
        );
        assert_eq!(storage.hget("hash1", "missing").await.unwrap(), None);

        let all = storage.hgetall("hash1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("field2"), Some(&json!("value2")));

        assert!(storage.hdel("hash1", "field1").await.unwrap());
        assert!(!storage.hdel("hash1", "field1").await.unwrap());
        assert!(!storage.hdel("missing", "field1").await.unwrap());
    }

    #[tokio::test]
    async fn test_close_clears_state() {
        let storage = MemoryStorage::new();
        storage.set("key", json!(1), None).await.unwrap();
        storage.hset("hash", "f", json!(1)).await.unwrap();

        storage.close().await.unwrap();
        assert_eq!(storage.get("key").await.unwrap(), None);
        assert!(storage.hgetall("hash").await.unwrap().is_empty());
        // close is idempotent
        storage.close().await.unwrap();
    }
}
