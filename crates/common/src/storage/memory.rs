use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{BlobStorage, StorageError};

/// In-memory dataset, cloned handles share the same blobs
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_error<E: std::fmt::Display>(e: E) -> StorageError {
        StorageError::Internal(format!("failed to acquire lock: {}", e))
    }
}

#[async_trait]
impl BlobStorage for MemoryStorage {
    async fn ensure_dir(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.read().map_err(Self::lock_error)?;
        Ok(inner.keys().cloned().collect())
    }

    async fn read(&self, name: &str) -> Result<String, StorageError> {
        let inner = self.inner.read().map_err(Self::lock_error)?;
        inner
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn write_new(&self, name: &str, body: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(Self::lock_error)?;
        if inner.contains_key(name) {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        inner.insert(name.to_string(), body.to_string());
        Ok(())
    }

    async fn write(&self, name: &str, body: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(Self::lock_error)?;
        inner.insert(name.to_string(), body.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(Self::lock_error)?;
        inner
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let inner = self.inner.read().map_err(Self::lock_error)?;
        Ok(inner.contains_key(name))
    }
}
