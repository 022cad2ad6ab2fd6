//! Fault-injecting stores

use crate::crypto::{EncryptionKey, KeyBackingStore};
use crate::error::{StorageError, StorageResult};
use crate::kv::{KvStore, MemoryKvStore};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Key store that claims availability but fails every call
pub struct BrokenKeyStore {
    available: bool,
}

impl BrokenKeyStore {
    pub fn available() -> Self {
        Self { available: true }
    }
}

#[async_trait]
impl KeyBackingStore for BrokenKeyStore {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn load(&self) -> StorageResult<Option<EncryptionKey>> {
        Err(StorageError::Io("keystore read failed".to_string()))
    }

    async fn store(&self, _key: &EncryptionKey) -> StorageResult<()> {
        Err(StorageError::Io("keystore write failed".to_string()))
    }

    async fn delete(&self) -> StorageResult<()> {
        Err(StorageError::Io("keystore delete failed".to_string()))
    }
}

/// Memory store whose writes can be switched to fail
#[derive(Default)]
pub struct FailingKvStore {
    inner: MemoryKvStore,
    fail_writes: AtomicBool,
    fail_prefix: Mutex<Option<String>>,
}

impl FailingKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail only writes to keys starting with `prefix`
    pub fn fail_writes_to(&self, prefix: &str) {
        if let Ok(mut fail_prefix) = self.fail_prefix.lock() {
            *fail_prefix = Some(prefix.to_string());
        }
    }

    fn check(&self, key: &str) -> StorageResult<()> {
        let prefix_hit = self
            .fail_prefix
            .lock()
            .map(|prefix| prefix.as_deref().is_some_and(|p| key.starts_with(p)))
            .unwrap_or(false);

        if prefix_hit || self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Io("disk full".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KvStore for FailingKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.check(key)?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.check(key)?;
        self.inner.remove(key).await
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        self.inner.keys().await
    }
}
