//! Schema/Version Gate
//!
//! Runs before any other component touches the store. A store written by a
//! newer release is rejected without writing anything; an older known schema
//! is migrated explicitly and logged.

use crate::error::{Error, Result};
use crate::store::{KeyLayout, StoreClient, StoreExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Schema written by this release
pub const CURRENT_STORE_SCHEMA_VERSION: u32 = 2;

/// Oldest schema this release can migrate from
pub const MIN_MIGRATABLE_STORE_SCHEMA_VERSION: u32 = 1;

/// Version record stored at `/<orchestrator>/version`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentStateVersion {
    pub store_schema_version: u32,
    pub orchestrator_api_version: u32,
    /// Whether publication records are known to be complete
    #[serde(default)]
    pub publications_synced: bool,
}

/// Outcome of a successful gate check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    /// No version record existed; one was written
    Fresh,
    Current,
    Migrated { from: u32 },
}

pub struct SchemaGate<'a> {
    store: &'a dyn StoreClient,
    keys: &'a KeyLayout,
    api_version: u32,
}

impl<'a> SchemaGate<'a> {
    pub fn new(store: &'a dyn StoreClient, keys: &'a KeyLayout, api_version: u32) -> Self {
        Self {
            store,
            keys,
            api_version,
        }
    }

    /// Validate the stored schema, migrating older known versions
    pub async fn check(&self) -> Result<(SchemaStatus, PersistentStateVersion)> {
        let key = self.keys.version();
        let stored: Option<PersistentStateVersion> = self.store.get_record(&key).await?;

        let stored = match stored {
            Some(v) => v,
            None => {
                let fresh = PersistentStateVersion {
                    store_schema_version: CURRENT_STORE_SCHEMA_VERSION,
                    orchestrator_api_version: self.api_version,
                    publications_synced: true,
                };
                self.store.put_record(&key, &fresh).await?;
                info!(
                    "Initialized fresh store at schema version {}",
                    CURRENT_STORE_SCHEMA_VERSION
                );
                return Ok((SchemaStatus::Fresh, fresh));
            }
        };

        let found = stored.store_schema_version;
        if found > CURRENT_STORE_SCHEMA_VERSION {
            warn!(
                "Store schema version {} is newer than supported version {}",
                found, CURRENT_STORE_SCHEMA_VERSION
            );
            return Err(Error::UnsupportedStoreVersion {
                found,
                supported: CURRENT_STORE_SCHEMA_VERSION,
            });
        }
        if found < MIN_MIGRATABLE_STORE_SCHEMA_VERSION {
            warn!(
                "Store schema version {} predates every known migration",
                found
            );
            return Err(Error::StoreSchemaTooOld {
                found,
                oldest: MIN_MIGRATABLE_STORE_SCHEMA_VERSION,
            });
        }
        if found == CURRENT_STORE_SCHEMA_VERSION {
            return Ok((SchemaStatus::Current, stored));
        }

        let migrated = self.migrate(stored).await?;
        Ok((SchemaStatus::Migrated { from: found }, migrated))
    }

    async fn migrate(&self, stored: PersistentStateVersion) -> Result<PersistentStateVersion> {
        let from = stored.store_schema_version;
        info!(
            "Migrating store schema from version {} to {}",
            from, CURRENT_STORE_SCHEMA_VERSION
        );

        if from < 2 {
            self.assign_registration_order().await?;
        }

        let migrated = PersistentStateVersion {
            store_schema_version: CURRENT_STORE_SCHEMA_VERSION,
            orchestrator_api_version: self.api_version,
            // v1 never persisted publications
            publications_synced: false,
        };
        self.store.put_record(&self.keys.version(), &migrated).await?;
        info!("Store schema migration to version {} complete", CURRENT_STORE_SCHEMA_VERSION);
        Ok(migrated)
    }

    /// v1 backends carry no `registrationOrder`; number them by creation time
    async fn assign_registration_order(&self) -> Result<()> {
        let mut backends: Vec<(String, serde_json::Value)> =
            self.store.list_records(&self.keys.backends()).await?;

        backends.sort_by(|(ka, a), (kb, b)| {
            let ta = a.get("createdAt").and_then(|v| v.as_str()).unwrap_or("");
            let tb = b.get("createdAt").and_then(|v| v.as_str()).unwrap_or("");
            ta.cmp(tb).then_with(|| ka.cmp(kb))
        });

        for (order, (key, mut record)) in backends.into_iter().enumerate() {
            if record.get("registrationOrder").is_some() {
                continue;
            }
            if let Some(fields) = record.as_object_mut() {
                fields.insert("registrationOrder".into(), serde_json::json!(order as u64));
            }
            self.store.put_record(&key, &record).await?;
            info!("Assigned registration order {} to {}", order, key);
        }
        Ok(())
    }

    /// Record that publications have been reconciled
    pub async fn mark_publications_synced(&self, version: &PersistentStateVersion) -> Result<()> {
        if version.publications_synced {
            return Ok(());
        }
        let synced = PersistentStateVersion {
            publications_synced: true,
            ..version.clone()
        };
        self.store.put_record(&self.keys.version(), &synced).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use assert_matches::assert_matches;

    fn keys() -> KeyLayout {
        KeyLayout::new("vorch")
    }

    #[tokio::test]
    async fn test_fresh_store_gets_current_version() {
        let store = InMemoryStore::new();
        let keys = keys();
        let gate = SchemaGate::new(&store, &keys, 1);

        let (status, version) = gate.check().await.unwrap();
        assert_eq!(status, SchemaStatus::Fresh);
        assert_eq!(version.store_schema_version, CURRENT_STORE_SCHEMA_VERSION);
        assert!(store.get(&keys.version()).await.unwrap().is_some());

        let (status, _) = gate.check().await.unwrap();
        assert_eq!(status, SchemaStatus::Current);
    }

    #[tokio::test]
    async fn test_newer_schema_is_fatal_and_writes_nothing() {
        let store = InMemoryStore::new();
        let keys = keys();
        store
            .put(
                &keys.version(),
                r#"{"storeSchemaVersion":99,"orchestratorApiVersion":1}"#,
            )
            .await
            .unwrap();
        let writes_before = store.write_count();

        let err = SchemaGate::new(&store, &keys, 1).check().await.unwrap_err();
        assert_matches!(err, Error::UnsupportedStoreVersion { found: 99, .. });
        assert!(err.to_string().contains("downgrade not supported"));
        assert_eq!(store.write_count(), writes_before);
    }

    #[tokio::test]
    async fn test_unknown_old_schema_is_fatal() {
        let store = InMemoryStore::new();
        let keys = keys();
        store
            .put(&keys.version(), r#"{"storeSchemaVersion":0,"orchestratorApiVersion":1}"#)
            .await
            .unwrap();
        let err = SchemaGate::new(&store, &keys, 1).check().await.unwrap_err();
        assert_matches!(err, Error::StoreSchemaTooOld { found: 0, oldest: 1 });
        assert!(err.to_string().contains("too old to migrate"));
    }

    #[tokio::test]
    async fn test_v1_migration_numbers_backends() {
        let store = InMemoryStore::new();
        let keys = keys();
        store
            .put(&keys.version(), r#"{"storeSchemaVersion":1,"orchestratorApiVersion":1}"#)
            .await
            .unwrap();
        store
            .put("/vorch/backends/b", r#"{"name":"late","createdAt":"2024-02-01T00:00:00Z"}"#)
            .await
            .unwrap();
        store
            .put("/vorch/backends/a", r#"{"name":"early","createdAt":"2024-01-01T00:00:00Z"}"#)
            .await
            .unwrap();

        let (status, version) = SchemaGate::new(&store, &keys, 1).check().await.unwrap();
        assert_eq!(status, SchemaStatus::Migrated { from: 1 });
        assert!(!version.publications_synced);

        let early: serde_json::Value = store.get_record("/vorch/backends/a").await.unwrap().unwrap();
        let late: serde_json::Value = store.get_record("/vorch/backends/b").await.unwrap().unwrap();
        assert_eq!(early["registrationOrder"], 0);
        assert_eq!(late["registrationOrder"], 1);

        let stored: PersistentStateVersion =
            store.get_record(&keys.version()).await.unwrap().unwrap();
        assert_eq!(stored.store_schema_version, CURRENT_STORE_SCHEMA_VERSION);
    }
}
