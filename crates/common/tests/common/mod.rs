//! Shared test utilities for vault integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::crypto::{Secret, SecretCipher};
use common::internal_fs::InternalFs;
use common::storage::{BlobStorage, FsStorage, StorageError};
use common::tree::Tree;
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Storage wrapper that can be told to fail some operations
#[derive(Debug, Clone)]
pub struct FlakyStorage {
    inner: FsStorage,
    fail_deletes: Arc<AtomicBool>,
    fail_index_writes: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl FlakyStorage {
    pub fn new(inner: FsStorage) -> Self {
        Self {
            inner,
            fail_deletes: Arc::new(AtomicBool::new(false)),
            fail_index_writes: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Fail writes of index snapshots only (blob names starting with `0`)
    pub fn fail_index_writes(&self, fail: bool) {
        self.fail_index_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self, name: &str) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst)
            || (name.starts_with('0') && self.fail_index_writes.load(Ordering::SeqCst))
        {
            return Err(StorageError::Internal(format!("injected write failure: {}", name)));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for FlakyStorage {
    async fn ensure_dir(&self) -> Result<(), StorageError> {
        self.inner.ensure_dir().await
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        self.inner.list().await
    }

    async fn read(&self, name: &str) -> Result<String, StorageError> {
        self.inner.read(name).await
    }

    async fn write_new(&self, name: &str, body: &str) -> Result<(), StorageError> {
        self.check_write(name)?;
        self.inner.write_new(name, body).await
    }

    async fn write(&self, name: &str, body: &str) -> Result<(), StorageError> {
        self.check_write(name)?;
        self.inner.write(name, body).await
    }

    async fn delete(&self, name: &str) -> Result<(), StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Internal(format!("injected delete failure: {}", name)));
        }
        self.inner.delete(name).await
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.exists(name).await
    }
}

/// One vault session over a temporary data directory
pub struct TestEnv {
    pub storage: FlakyStorage,
    pub cipher: Arc<SecretCipher>,
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let storage = FlakyStorage::new(FsStorage::new(temp_dir.path().join("data")));
        let cipher = Arc::new(SecretCipher::new(Secret::generate().unwrap()));
        Self {
            storage,
            cipher,
            temp_dir,
        }
    }

    /// A new, unloaded tree over the same dataset, as after a restart
    pub fn tree(&self) -> Tree {
        Tree::new(self.cipher.clone(), Arc::new(self.storage.clone()))
    }

    /// A new session over the same dataset, loaded
    pub async fn open(&self) -> InternalFs {
        let mut fs = InternalFs::new(self.tree());
        fs.init().await.unwrap();
        fs
    }

    /// Filenames in the dataset directory starting with a type digit
    pub async fn blobs_of_type(&self, digit: char) -> Vec<String> {
        self.storage
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|f| f.starts_with(digit))
            .collect()
    }
}

/// Set up a test environment with a fresh, loaded vault
pub async fn setup_test_env() -> (InternalFs, TestEnv) {
    let env = TestEnv::new();
    let fs = env.open().await;
    (fs, env)
}

/// Path -> (id, current content) for every node, folders have no content
pub async fn snapshot(fs: &InternalFs) -> BTreeMap<String, (String, Option<String>)> {
    let mut out = BTreeMap::new();
    for (path, id) in fs.tree().graph().paths() {
        let node = fs.tree().graph().get(&id).unwrap();
        let content = if node.is_file() {
            Some(fs.cat(&path, None).await.unwrap())
        } else {
            None
        };
        out.insert(path, (id, content));
    }
    out
}
