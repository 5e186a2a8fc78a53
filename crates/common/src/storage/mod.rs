//! Blob storage backends
//!
//! A dataset is one flat directory of blobs. The tree only ever talks to it
//! through [`BlobStorage`]:
//!
//! - **[`FsStorage`]**: a directory on the local filesystem
//! - **[`MemoryStorage`]**: a shared in-memory map, for tests and scratch vaults

mod fs;
mod memory;

use std::fmt::Debug;

use async_trait::async_trait;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

/// Errors that can occur when working with a blob directory
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A blob that must be new already exists
    #[error("blob already exists: {0}")]
    AlreadyExists(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backend specific failure
    #[error("storage error: {0}")]
    Internal(String),
}

/// Storage service contract for one dataset directory.
///
/// Blob bodies are text: every body the tree writes is base64url, plus the
/// optional delimiter and extra name.
#[async_trait]
pub trait BlobStorage: Debug + Send + Sync {
    /// Create the dataset directory if it does not exist
    async fn ensure_dir(&self) -> Result<(), StorageError>;

    /// List every filename in the dataset directory
    async fn list(&self) -> Result<Vec<String>, StorageError>;

    async fn read(&self, name: &str) -> Result<String, StorageError>;

    /// Write a blob that must not exist yet
    ///
    /// Should fail with `StorageError::AlreadyExists` if `name` is present,
    ///  leaving the existing blob untouched.
    async fn write_new(&self, name: &str, body: &str) -> Result<(), StorageError>;

    /// Write a blob, replacing any previous body
    async fn write(&self, name: &str, body: &str) -> Result<(), StorageError>;

    async fn delete(&self, name: &str) -> Result<(), StorageError>;

    async fn exists(&self, name: &str) -> Result<bool, StorageError>;
}
