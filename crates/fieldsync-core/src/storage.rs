//! Storage trait abstraction for the durable local store.
//!
//! Implementations:
//! - `InMemoryStorage` - For testing (supports a byte-capacity cap so the
//!   storage-full path is exercisable)
//! - `NativeStorage` (in fieldsync-engine) - Uses tokio::fs
//!
//! Keys are flat slash-separated paths (`oplog/<entity>.json`,
//! `documents/<entity>.snap`). Everything behind this trait is local
//! disk; nothing here ever touches the network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Local storage full")]
    Full,

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Platform-independent durable key/value storage.
///
/// Implementations must be `Send + Sync` for use across tasks.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the value stored at a key
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Write a value (creates any parent structure if needed)
    async fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// List keys under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete a key
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;
}

/// In-memory storage for testing
pub struct InMemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
    /// Optional total-bytes cap; writes that would exceed it fail with
    /// `StorageError::Full`.
    capacity: Option<usize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: None,
        }
    }

    /// Create storage that refuses writes past a total byte budget.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity: Some(capacity),
        }
    }

    fn normalize_key(key: &str) -> String {
        key.trim_matches('/').to_string()
    }

    fn used_bytes(entries: &HashMap<String, Vec<u8>>) -> usize {
        entries.values().map(Vec::len).sum()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let key = Self::normalize_key(key);
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(&key)
            .cloned()
            .ok_or(StorageError::NotFound(key))
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let key = Self::normalize_key(key);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        if let Some(capacity) = self.capacity {
            let existing = entries.get(&key).map(Vec::len).unwrap_or(0);
            let projected = Self::used_bytes(&entries) - existing + value.len();
            if projected > capacity {
                return Err(StorageError::Full);
            }
        }

        entries.insert(key, value.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Self::normalize_key(prefix);
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", prefix)
        };

        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = Self::normalize_key(key);
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .remove(&key)
            .map(|_| ())
            .ok_or(StorageError::NotFound(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let key = Self::normalize_key(key);
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.contains_key(&key))
    }
}

// Implement Storage for Arc<T> where T: Storage
// This allows sharing a store between the oplog and the document store in tests
#[async_trait]
impl<T: Storage + Send + Sync> Storage for std::sync::Arc<T> {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        (**self).read(key).await
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).write(key, value).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key).await
    }
}
