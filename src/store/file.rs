//! File-backed store
//!
//! One JSON file per key under a root directory. Filenames are the SHA-256 of
//! the key, sharded into subdirectories by the first byte; the key itself is
//! kept inside the file so the index can be rebuilt on open. Writes go to a
//! temporary file that is synced and then renamed over the target.

use crate::error::{Error, Result};
use crate::store::StoreClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

// =============================================================================
// File Store Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    /// Root directory for record files
    pub root_path: PathBuf,
    /// fsync every write before renaming it into place
    pub sync_writes: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/volume-orchestrator"),
            sync_writes: true,
        }
    }
}

/// On-disk envelope for one key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    key: String,
    value: String,
    updated_at: DateTime<Utc>,
}

// =============================================================================
// File Store
// =============================================================================

pub struct FileStore {
    root_path: PathBuf,
    sync_writes: bool,
    /// Known keys and their files
    index: RwLock<BTreeMap<String, PathBuf>>,
}

impl FileStore {
    pub async fn with_path(root_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_config(FileStoreConfig {
            root_path: root_path.into(),
            ..Default::default()
        })
        .await
    }

    pub async fn with_config(config: FileStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.root_path).await?;

        let store = Self {
            root_path: config.root_path,
            sync_writes: config.sync_writes,
            index: RwLock::new(BTreeMap::new()),
        };
        store.rebuild_index().await?;
        Ok(store)
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    /// Scan shard directories and index every readable record
    async fn rebuild_index(&self) -> Result<()> {
        let mut found = BTreeMap::new();

        let mut shards = fs::read_dir(&self.root_path).await?;
        while let Some(shard) = shards.next_entry().await? {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }

            let mut entries = fs::read_dir(&shard_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().map(|e| e != "json").unwrap_or(true) {
                    continue;
                }
                match read_record(&path).await {
                    Ok(record) => {
                        found.insert(record.key, path);
                    }
                    Err(e) => warn!("Skipping unreadable store file {}: {}", path.display(), e),
                }
            }
        }

        debug!("File store indexed {} records", found.len());
        *self.index.write() = found;
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.root_path
            .join(&digest[..2])
            .join(format!("{}.json", digest))
    }

    async fn write_atomic(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(contents).await?;
        if self.sync_writes {
            file.sync_all().await?;
        }
        drop(file);

        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }
}

async fn read_record(path: &Path) -> Result<StoredRecord> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

#[async_trait]
impl StoreClient for FileStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.index.read().get(key).cloned();
        let path = match path {
            Some(p) => p,
            None => return Ok(None),
        };

        match read_record(&path).await {
            Ok(record) => Ok(Some(record.value)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.write().remove(key);
                Ok(None)
            }
            Err(Error::Io(e)) => Err(Error::store_unavailable("get", key, e)),
            Err(e) => Err(Error::CorruptRecord {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let record = StoredRecord {
            key: key.to_string(),
            value: value.to_string(),
            updated_at: Utc::now(),
        };
        let contents = serde_json::to_vec(&record)?;
        let path = self.file_path(key);

        self.write_atomic(&path, &contents)
            .await
            .map_err(|e| Error::store_unavailable("put", key, e))?;

        self.index.write().insert(key.to_string(), path);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.file_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::store_unavailable("delete", key, e)),
        }
        self.index.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let keys: Vec<String> = {
            let index = self.index.read();
            index
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }

    async fn health_check(&self) -> Result<bool> {
        let probe = self.root_path.join(".health_check");
        match fs::write(&probe, b"ok").await {
            Ok(_) => {
                let _ = fs::remove_file(&probe).await;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (FileStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::with_path(tmp.path()).await.unwrap();
        (store, tmp)
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let (store, _tmp) = test_store().await;

        store.put("/vorch/volumes/a", r#"{"n":1}"#).await.unwrap();
        assert_eq!(
            store.get("/vorch/volumes/a").await.unwrap().as_deref(),
            Some(r#"{"n":1}"#)
        );

        store.put("/vorch/volumes/a", r#"{"n":2}"#).await.unwrap();
        assert_eq!(
            store.get("/vorch/volumes/a").await.unwrap().as_deref(),
            Some(r#"{"n":2}"#)
        );

        store.delete("/vorch/volumes/a").await.unwrap();
        assert!(store.get("/vorch/volumes/a").await.unwrap().is_none());
        store.delete("/vorch/volumes/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = FileStore::with_path(tmp.path()).await.unwrap();
            store.put("/vorch/version", "{}").await.unwrap();
            store.put("/vorch/volumes/b", "2").await.unwrap();
            store.put("/vorch/volumes/a", "1").await.unwrap();
        }

        let store = FileStore::with_path(tmp.path()).await.unwrap();
        let listed = store.list("/vorch/volumes/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ("/vorch/volumes/a".to_string(), "1".to_string()),
                ("/vorch/volumes/b".to_string(), "2".to_string()),
            ]
        );
        assert!(store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_no_temporary_files_left_behind() {
        let (store, tmp) = test_store().await;
        store.put("/vorch/nodes/n1", "{}").await.unwrap();

        let path = store.file_path("/vorch/nodes/n1");
        let mut shard = std::fs::read_dir(path.parent().unwrap()).unwrap();
        let only = shard.next().unwrap().unwrap().path();
        assert_eq!(only, path);
        assert!(shard.next().is_none());
        drop(tmp);
    }
}
