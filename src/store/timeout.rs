//! Per-call timeout wrapper
//!
//! Bounds every store call so a hung store surfaces as `StoreUnavailable`
//! instead of stalling the caller.

use crate::error::{Error, Result};
use crate::store::{StoreClient, StoreRef};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub struct TimeoutStore {
    inner: StoreRef,
    timeout: Duration,
}

impl TimeoutStore {
    pub fn new(inner: StoreRef, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T, F>(&self, operation: &str, key: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Store {} on '{}' timed out after {:?}",
                    operation, key, self.timeout
                );
                Err(Error::store_unavailable(
                    operation,
                    key,
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        }
    }
}

#[async_trait]
impl StoreClient for TimeoutStore {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.bounded("get", key, self.inner.get(key)).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.bounded("put", key, self.inner.put(key, value)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.bounded("delete", key, self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.bounded("list", prefix, self.inner.list(prefix)).await
    }

    async fn health_check(&self) -> Result<bool> {
        self.bounded("health_check", "", self.inner.health_check())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let inner = Arc::new(InMemoryStore::new());
        inner.set_latency(Duration::from_secs(30));
        let store = TimeoutStore::new(inner, Duration::from_secs(10));

        let err = store.get("/vorch/version").await.unwrap_err();
        assert_matches!(err, Error::StoreUnavailable { ref operation, .. } if operation == "get");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_store_passes_through() {
        let inner = Arc::new(InMemoryStore::new());
        inner.set_latency(Duration::from_millis(5));
        let store = TimeoutStore::new(inner, Duration::from_secs(10));

        store.put("/vorch/a", "1").await.unwrap();
        assert_eq!(store.get("/vorch/a").await.unwrap().as_deref(), Some("1"));
    }
}
