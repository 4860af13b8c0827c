//! In-memory store
//!
//! Ordered map behind a `parking_lot` lock. Used by tests and standalone mode;
//! availability and latency can be toggled to simulate an unreachable store.

use crate::error::{Error, Result};
use crate::store::StoreClient;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Store backed by a `BTreeMap`
#[derive(Debug)]
pub struct InMemoryStore {
    data: RwLock<BTreeMap<String, String>>,
    /// Is the store reachable
    available: AtomicBool,
    /// Artificial latency per call in milliseconds
    latency_ms: AtomicU64,
    /// Successful mutating calls
    writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Set availability (for testing)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Delay every call by `latency` (for testing timeouts)
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successful puts and deletes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    async fn enter(&self, operation: &str, key: &str) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_available() {
            return Err(Error::store_unavailable(operation, key, "connection refused"));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.enter("get", key).await?;
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.enter("put", key).await?;
        self.data.write().insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.enter("delete", key).await?;
        self.data.write().remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.enter("list", prefix).await?;
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.is_available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_basic_operations() {
        let store = InMemoryStore::new();

        store.put("/v/a", "1").await.unwrap();
        assert_eq!(store.get("/v/a").await.unwrap().as_deref(), Some("1"));
        assert!(store.get("/v/b").await.unwrap().is_none());

        store.delete("/v/a").await.unwrap();
        assert!(store.get("/v/a").await.unwrap().is_none());

        // Deleting an absent key succeeds
        store.delete("/v/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_prefix_bounded() {
        let store = InMemoryStore::new();
        store.put("/v/vol/c", "3").await.unwrap();
        store.put("/v/vol/a", "1").await.unwrap();
        store.put("/v/vol/b", "2").await.unwrap();
        store.put("/v/volx", "x").await.unwrap();
        store.put("/v/other/a", "o").await.unwrap();

        let keys: Vec<String> = store
            .list("/v/vol/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["/v/vol/a", "/v/vol/b", "/v/vol/c"]);
    }

    #[tokio::test]
    async fn test_unavailable_is_distinct_from_absent() {
        let store = InMemoryStore::new();
        store.set_available(false);

        let err = store.get("/v/a").await.unwrap_err();
        assert_matches!(err, Error::StoreUnavailable { .. });
        assert!(!store.health_check().await.unwrap());

        store.set_available(true);
        assert!(store.get("/v/a").await.unwrap().is_none());
    }

    #[test]
    fn test_write_count_tracks_mutations() {
        let store = InMemoryStore::new();
        tokio_test::block_on(async {
            tokio_test::assert_ok!(store.put("/v/a", "1").await);
            tokio_test::assert_ok!(store.put("/v/a", "2").await);
            tokio_test::assert_ok!(store.delete("/v/a").await);
            tokio_test::assert_ok!(store.get("/v/a").await);
        });
        assert_eq!(store.write_count(), 3);
    }
}
