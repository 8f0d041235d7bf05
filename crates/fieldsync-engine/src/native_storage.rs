//! Native storage implementation using tokio::fs.

use async_trait::async_trait;
use fieldsync_core::storage::{Result, Storage, StorageError};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

/// Durable store rooted at a base directory on the local filesystem.
pub struct NativeStorage {
    base_path: PathBuf,
}

impl NativeStorage {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        if key.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(key)
        }
    }

    fn map_err(key: &str, err: std::io::Error) -> StorageError {
        match err.kind() {
            ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            ErrorKind::StorageFull | ErrorKind::QuotaExceeded => StorageError::Full,
            _ => StorageError::Io(err.to_string()),
        }
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(key);
        fs::read(&full_path)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let full_path = self.full_path(key);

        // Create parent directories if needed
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::map_err(key, e))?;
        }

        fs::write(&full_path, value)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut keys = Vec::new();

        let mut dir = match fs::read_dir(&full_path).await {
            Ok(dir) => dir,
            // A prefix that was never written to is just empty
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(Self::map_err(prefix, e)),
        };

        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Self::map_err(prefix, e))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| Self::map_err(prefix, e))?;
            if metadata.is_file() {
                let name = entry.file_name().to_string_lossy().to_string();
                if prefix.is_empty() {
                    keys.push(name);
                } else {
                    keys.push(format!("{prefix}/{name}"));
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_path = self.full_path(key);
        fs::remove_file(&full_path)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let full_path = self.full_path(key);
        fs::try_exists(&full_path)
            .await
            .map_err(|e| Self::map_err(key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = NativeStorage::new(dir.path().to_path_buf());

        storage
            .write("oplog/p-1.json", b"[{\"id\":1}]")
            .await
            .unwrap();
        let bytes = storage.read("oplog/p-1.json").await.unwrap();
        assert_eq!(bytes, b"[{\"id\":1}]");
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage = NativeStorage::new(dir.path().to_path_buf());

        let err = storage.read("missing.json").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_unwritten_prefix_is_empty() {
        let dir = TempDir::new().unwrap();
        let storage = NativeStorage::new(dir.path().to_path_buf());

        assert!(storage.list("oplog").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_returns_prefixed_keys_sorted() {
        let dir = TempDir::new().unwrap();
        let storage = NativeStorage::new(dir.path().to_path_buf());

        storage.write("documents/b.snap", b"b").await.unwrap();
        storage.write("documents/a.snap", b"a").await.unwrap();

        let keys = storage.list("documents").await.unwrap();
        assert_eq!(keys, vec!["documents/a.snap", "documents/b.snap"]);
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let dir = TempDir::new().unwrap();
        let storage = NativeStorage::new(dir.path().to_path_buf());

        storage.write("replica.json", b"{}").await.unwrap();
        assert!(storage.exists("replica.json").await.unwrap());

        storage.delete("replica.json").await.unwrap();
        assert!(!storage.exists("replica.json").await.unwrap());
    }
}
