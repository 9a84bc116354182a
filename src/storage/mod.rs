pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by storage backends. Connection and command failures from
/// remote backends collapse into `Backend`; callers do not retry.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("failed to encode stored value: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Keyed store with hash fields, glob key listing, and per-key TTL.
///
/// Values are opaque JSON. TTL is measured from the last `set`; an expired
/// key is reported absent. Pattern matching for `keys` is glob with `*` and
/// `?`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StorageError>;
    /// Delete a key. Returns true if the key existed.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
    #[allow(dead_code)]
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StorageError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Value>, StorageError>;
    async fn hset(&self, key: &str, field: &str, value: Value) -> Result<(), StorageError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Value>, StorageError>;
    /// Delete a hash field. Returns true if the field existed.
    async fn hdel(&self, key: &str, field: &str) -> Result<bool, StorageError>;

    /// Release connections. Idempotent.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Glob match supporting `*` (any run) and `?` (any single char).
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let c: Vec<char> = candidate.chars().collect();

    let (mut pi, mut ci) = (0usize, 0usize);
    let (mut star_pi, mut star_ci) = (usize::MAX, 0usize);

    while ci < c.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == c[ci]) {
            pi += 1;
            ci += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star_pi = pi;
            star_ci = ci;
            pi += 1;
        } else if star_pi != usize::MAX {
            // Backtrack: let the last '*' absorb one more character
            pi = star_pi + 1;
            star_ci += 1;
            ci = star_ci;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
