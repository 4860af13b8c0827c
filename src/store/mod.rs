//! Persistent Store Client
//!
//! Versioned key-value abstraction over the external durable store. Every
//! other component reads and writes orchestrator state through `StoreClient`;
//! the implementations differ only in where the bytes live.
//!
//! ```text
//!   TimeoutStore ──► InMemoryStore   (tests, standalone)
//!        │       ──► FileStore       (one JSON file per key)
//!        │       ──► KubeStore       (one OrchestratorRecord CR per key)
//!        ▼
//!   StoreExt (typed JSON records)
//! ```

mod crd;
mod file;
pub mod keys;
mod memory;
pub mod schema;
mod timeout;

pub use crd::{KubeStore, OrchestratorRecord, OrchestratorRecordSpec};
pub use file::{FileStore, FileStoreConfig};
pub use keys::KeyLayout;
pub use memory::InMemoryStore;
pub use schema::{
    PersistentStateVersion, SchemaGate, SchemaStatus, CURRENT_STORE_SCHEMA_VERSION,
    MIN_MIGRATABLE_STORE_SCHEMA_VERSION,
};
pub use timeout::TimeoutStore;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

// =============================================================================
// StoreClient Trait
// =============================================================================

/// Port for the durable key-value store
///
/// Absent keys are `Ok(None)`; an unreachable store is `StoreUnavailable`.
/// The two are never conflated and failures are never swallowed.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Short implementation name for logs
    fn kind(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a key. Deleting an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All entries whose key starts with `prefix`, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Probe connectivity
    async fn health_check(&self) -> Result<bool>;
}

pub type StoreRef = Arc<dyn StoreClient>;

// =============================================================================
// Typed Records
// =============================================================================

/// JSON record helpers over any `StoreClient`
///
/// Decoding ignores unknown fields, so records written by newer releases of
/// the same schema version still load.
#[async_trait]
pub trait StoreExt: StoreClient {
    async fn get_record<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(raw) => decode(key, &raw).map(Some),
            None => Ok(None),
        }
    }

    async fn put_record<T>(&self, key: &str, record: &T) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(record)?;
        self.put(key, &raw).await
    }

    async fn list_records<T>(&self, prefix: &str) -> Result<Vec<(String, T)>>
    where
        T: DeserializeOwned + Send,
    {
        let entries = self.list(prefix).await?;
        entries
            .into_iter()
            .map(|(key, raw)| decode(&key, &raw).map(|record| (key, record)))
            .collect()
    }
}

impl<S: StoreClient + ?Sized> StoreExt for S {}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::CorruptRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
