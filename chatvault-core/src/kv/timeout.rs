//! Deadline decorator for a [`KvStore`]
//!
//! A stalled read or write otherwise stalls its caller forever; every call
//! through [`TimeoutKvStore`] fails with [`StorageError::Timeout`] instead.

use super::KvStore;
use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Wraps another store and bounds each call by `timeout`
pub struct TimeoutKvStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: KvStore> TimeoutKvStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(&self, fut: impl Future<Output = StorageResult<T>>) -> StorageResult<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StorageError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl<S: KvStore> KvStore for TimeoutKvStore<S> {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.bounded(self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.bounded(self.inner.set(key, value)).await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.bounded(self.inner.remove(key)).await
    }

    async fn keys(&self) -> StorageResult<Vec<String>> {
        self.bounded(self.inner.keys()).await
    }
}
