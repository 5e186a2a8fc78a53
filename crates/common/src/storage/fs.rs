use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{BlobStorage, StorageError};

/// Dataset stored as a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." {
            return Err(StorageError::Internal(format!("invalid blob name: {}", name)));
        }
        Ok(self.dir.join(name))
    }
}

fn map_not_found(e: std::io::Error, name: &str) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        e.into()
    }
}

#[async_trait]
impl BlobStorage for FsStorage {
    async fn ensure_dir(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = item.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<String, StorageError> {
        tokio::fs::read_to_string(self.path(name)?)
            .await
            .map_err(|e| map_not_found(e, name))
    }

    async fn write_new(&self, name: &str, body: &str) -> Result<(), StorageError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(name)?)
            .await
            .map_err(|e| {
                if e.kind() == ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists(name.to_string())
                } else {
                    e.into()
                }
            })?;
        file.write_all(body.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn write(&self, name: &str, body: &str) -> Result<(), StorageError> {
        tokio::fs::write(self.path(name)?, body).await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        tokio::fs::remove_file(self.path(name)?)
            .await
            .map_err(|e| map_not_found(e, name))
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(tokio::fs::try_exists(self.path(name)?).await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_new_refuses_existing() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path().join("data"));
        storage.ensure_dir().await.unwrap();

        storage.write_new("1abc", "first").await.unwrap();
        let err = storage.write_new("1abc", "second").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        assert_eq!(storage.read("1abc").await.unwrap(), "first");

        storage.write("1abc", "third").await.unwrap();
        assert_eq!(storage.read("1abc").await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path());
        assert!(storage.list().await.unwrap().is_empty());

        storage.write_new("2b", "x").await.unwrap();
        storage.write_new("1a", "y").await.unwrap();
        tokio::fs::create_dir(temp.path().join("nested")).await.unwrap();
        assert_eq!(storage.list().await.unwrap(), vec!["1a", "2b"]);

        storage.delete("1a").await.unwrap();
        assert!(!storage.exists("1a").await.unwrap());
        assert!(matches!(
            storage.delete("1a").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_dir_lists_empty() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path().join("not-there"));
        assert!(storage.list().await.unwrap().is_empty());
    }
}
