//! In-memory storage driver
//!
//! Simulates an array entirely in process: volumes, snapshots and
//! publications live in maps. Configured from the backend's JSON config and
//! used by standalone mode and tests, which can inject faults and latency.

use crate::domain::{
    AccessMode, Node, Offer, Protocol, StorageDriver, StoragePool, Topology, Volume,
};
use crate::domain::ports::PublishInfo;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub const FAKE_DRIVER_NAME: &str = "fake";

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FakeDriverConfig {
    /// Protocol of pools that do not set one
    pub protocol: Protocol,
    pub multi_node: bool,
    pub target_portal: String,
    pub iqn_prefix: String,
    pub pools: Vec<FakePoolConfig>,
    /// Array volumes that exist before the orchestrator knows them, by name
    pub existing_volumes: BTreeMap<String, u64>,
    /// Fail `initialize` (simulates an unreachable array)
    pub fail_initialize: bool,
}

impl Default for FakeDriverConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Block,
            multi_node: false,
            target_portal: "127.0.0.1:3260".to_string(),
            iqn_prefix: "iqn.2024-01.io.billyronks.fake".to_string(),
            pools: vec![FakePoolConfig::default()],
            existing_volumes: BTreeMap::new(),
            fail_initialize: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FakePoolConfig {
    pub name: String,
    pub protocol: Option<Protocol>,
    pub attributes: BTreeMap<String, Offer>,
    pub access_modes: BTreeSet<AccessMode>,
    pub topology: Topology,
}

impl Default for FakePoolConfig {
    fn default() -> Self {
        Self {
            name: "pool-0".to_string(),
            protocol: None,
            attributes: BTreeMap::new(),
            access_modes: BTreeSet::new(),
            topology: Topology::new(),
        }
    }
}

// =============================================================================
// Array State
// =============================================================================

/// Driver operations that can be faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    Initialize,
    Create,
    Clone,
    Import,
    Resize,
    Destroy,
    Publish,
    Unpublish,
    CreateSnapshot,
    DeleteSnapshot,
}

#[derive(Debug, Clone, Default)]
struct ArrayVolume {
    size_bytes: u64,
    snapshots: BTreeMap<String, u64>,
    published_to: BTreeSet<String>,
}

// =============================================================================
// Fake Driver
// =============================================================================

pub struct FakeDriver {
    config: FakeDriverConfig,
    /// Volumes by internal name
    volumes: RwLock<BTreeMap<String, ArrayVolume>>,
    /// Unmanaged array volumes available for import
    unmanaged: RwLock<BTreeMap<String, u64>>,
    /// Remaining injected failures per operation
    faults: Mutex<HashMap<FakeOp, u32>>,
    calls: Mutex<HashMap<FakeOp, u64>>,
    latency_ms: AtomicU64,
    healthy: AtomicBool,
}

impl FakeDriver {
    pub fn new(config: FakeDriverConfig) -> Self {
        let unmanaged = config.existing_volumes.clone();
        Self {
            config,
            volumes: RwLock::new(BTreeMap::new()),
            unmanaged: RwLock::new(unmanaged),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            latency_ms: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    /// Build from a backend's JSON config; unknown keys are ignored
    pub fn from_config(config: &serde_json::Value) -> Result<Self> {
        let parsed: FakeDriverConfig = if config.is_null() {
            FakeDriverConfig::default()
        } else {
            serde_json::from_value(config.clone()).map_err(|e| {
                Error::Configuration(format!("invalid fake driver config: {}", e))
            })?
        };
        if parsed.pools.is_empty() {
            return Err(Error::Configuration(
                "fake driver config must declare at least one pool".into(),
            ));
        }
        Ok(Self::new(parsed))
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail_next(&self, op: FakeOp, times: u32) {
        self.faults.lock().insert(op, times);
    }

    /// Delay every operation (for cancellation tests)
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn call_count(&self, op: FakeOp) -> u64 {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn has_volume(&self, internal_name: &str) -> bool {
        self.volumes.read().contains_key(internal_name)
    }

    pub fn volume_size(&self, internal_name: &str) -> Option<u64> {
        self.volumes.read().get(internal_name).map(|v| v.size_bytes)
    }

    pub fn has_snapshot(&self, internal_name: &str, snapshot: &str) -> bool {
        self.volumes
            .read()
            .get(internal_name)
            .map(|v| v.snapshots.contains_key(snapshot))
            .unwrap_or(false)
    }

    pub fn is_published(&self, internal_name: &str, node: &str) -> bool {
        self.volumes
            .read()
            .get(internal_name)
            .map(|v| v.published_to.contains(node))
            .unwrap_or(false)
    }

    /// Place an unmanaged volume on the array
    pub fn add_unmanaged_volume(&self, name: &str, size_bytes: u64) {
        self.unmanaged.write().insert(name.to_string(), size_bytes);
    }

    /// Count the call, apply latency, then fire any injected fault
    async fn enter(&self, op: FakeOp, target: &str) -> Result<()> {
        *self.calls.lock().entry(op).or_default() += 1;

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let mut faults = self.faults.lock();
        if let Some(remaining) = faults.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Internal(format!(
                    "injected {:?} fault for {}",
                    op, target
                )));
            }
        }
        Ok(())
    }

    fn missing(volume: &Volume) -> Error {
        Error::not_found("ArrayVolume", volume.internal_name.clone())
    }
}

#[async_trait]
impl StorageDriver for FakeDriver {
    fn driver_name(&self) -> &str {
        FAKE_DRIVER_NAME
    }

    fn multi_node(&self) -> bool {
        self.config.multi_node
    }

    fn storage_pools(&self, backend_uuid: Uuid) -> Vec<StoragePool> {
        self.config
            .pools
            .iter()
            .map(|pool| StoragePool {
                name: pool.name.clone(),
                backend_uuid,
                protocol: pool.protocol.unwrap_or(self.config.protocol),
                attributes: pool.attributes.clone(),
                access_modes: pool.access_modes.clone(),
                topology: pool.topology.clone(),
            })
            .collect()
    }

    async fn initialize(&self) -> Result<()> {
        self.enter(FakeOp::Initialize, "array").await?;
        if self.config.fail_initialize {
            return Err(Error::Configuration("array unreachable".into()));
        }
        info!(
            "Fake array initialized with {} pool(s)",
            self.config.pools.len()
        );
        Ok(())
    }

    async fn create(&self, volume: &Volume) -> Result<()> {
        self.enter(FakeOp::Create, &volume.internal_name).await?;
        self.volumes
            .write()
            .entry(volume.internal_name.clone())
            .or_insert_with(|| ArrayVolume {
                size_bytes: volume.size_bytes,
                ..Default::default()
            });
        debug!("Fake array created {}", volume.internal_name);
        Ok(())
    }

    async fn create_clone(
        &self,
        source: &Volume,
        clone: &Volume,
        snapshot: Option<&str>,
    ) -> Result<()> {
        self.enter(FakeOp::Clone, &clone.internal_name).await?;
        let mut volumes = self.volumes.write();
        let size = {
            let src = volumes
                .get(&source.internal_name)
                .ok_or_else(|| Self::missing(source))?;
            match snapshot {
                Some(name) => *src.snapshots.get(name).ok_or_else(|| {
                    Error::not_found("Snapshot", format!("{}/{}", source.name, name))
                })?,
                None => src.size_bytes,
            }
        };
        volumes
            .entry(clone.internal_name.clone())
            .or_insert_with(|| ArrayVolume {
                size_bytes: size,
                ..Default::default()
            });
        Ok(())
    }

    async fn import(&self, original_name: &str, volume: &Volume) -> Result<u64> {
        self.enter(FakeOp::Import, original_name).await?;
        let size = self
            .unmanaged
            .write()
            .remove(original_name)
            .ok_or_else(|| Error::not_found("ArrayVolume", original_name))?;
        self.volumes.write().insert(
            volume.internal_name.clone(),
            ArrayVolume {
                size_bytes: size,
                ..Default::default()
            },
        );
        Ok(size)
    }

    async fn resize(&self, volume: &Volume, new_size_bytes: u64) -> Result<()> {
        self.enter(FakeOp::Resize, &volume.internal_name).await?;
        let mut volumes = self.volumes.write();
        let entry = volumes
            .get_mut(&volume.internal_name)
            .ok_or_else(|| Self::missing(volume))?;
        entry.size_bytes = entry.size_bytes.max(new_size_bytes);
        Ok(())
    }

    async fn destroy(&self, volume: &Volume) -> Result<()> {
        self.enter(FakeOp::Destroy, &volume.internal_name).await?;
        self.volumes.write().remove(&volume.internal_name);
        Ok(())
    }

    async fn publish(&self, volume: &Volume, node: &Node) -> Result<PublishInfo> {
        self.enter(FakeOp::Publish, &volume.internal_name).await?;
        let mut volumes = self.volumes.write();
        let entry = volumes
            .get_mut(&volume.internal_name)
            .ok_or_else(|| Self::missing(volume))?;
        entry.published_to.insert(node.name.clone());

        let info = match volume.protocol {
            Protocol::File => PublishInfo {
                export_path: Some(format!("/exports/{}", volume.internal_name)),
                ..Default::default()
            },
            Protocol::Block | Protocol::Any => PublishInfo {
                target_portal: Some(self.config.target_portal.clone()),
                target_iqn: Some(format!(
                    "{}:{}",
                    self.config.iqn_prefix,
                    volume.internal_name.to_lowercase()
                )),
                lun: Some(0),
                export_path: None,
            },
        };
        Ok(info)
    }

    async fn unpublish(&self, volume: &Volume, node: &Node) -> Result<()> {
        self.enter(FakeOp::Unpublish, &volume.internal_name).await?;
        if let Some(entry) = self.volumes.write().get_mut(&volume.internal_name) {
            entry.published_to.remove(&node.name);
        }
        Ok(())
    }

    async fn create_snapshot(&self, volume: &Volume, snapshot: &str) -> Result<u64> {
        self.enter(FakeOp::CreateSnapshot, &volume.internal_name)
            .await?;
        let mut volumes = self.volumes.write();
        let entry = volumes
            .get_mut(&volume.internal_name)
            .ok_or_else(|| Self::missing(volume))?;
        let size = entry.size_bytes;
        entry.snapshots.entry(snapshot.to_string()).or_insert(size);
        Ok(size)
    }

    async fn delete_snapshot(&self, volume: &Volume, snapshot: &str) -> Result<()> {
        self.enter(FakeOp::DeleteSnapshot, &volume.internal_name)
            .await?;
        if let Some(entry) = self.volumes.write().get_mut(&volume.internal_name) {
            entry.snapshots.remove(snapshot);
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::fixtures::volume;
    use serde_json::json;

    #[test]
    fn test_config_from_json() {
        let driver = FakeDriver::from_config(&json!({
            "protocol": "file",
            "multiNode": true,
            "storagePrefix": "ignored-by-driver",
            "pools": [
                {"name": "gold", "attributes": {"media": {"strings": ["ssd"]}}},
                {"name": "raw", "protocol": "block", "accessModes": ["ReadWriteOnce"]}
            ]
        }))
        .unwrap();

        assert!(driver.multi_node());
        let pools = driver.storage_pools(Uuid::nil());
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].protocol, Protocol::File);
        assert_eq!(pools[1].protocol, Protocol::Block);
        assert!(pools[0].attributes.contains_key("media"));
    }

    #[test]
    fn test_empty_pool_list_rejected() {
        assert!(FakeDriver::from_config(&json!({"pools": []})).is_err());
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_destroy_tolerates_absence() {
        let driver = FakeDriver::new(FakeDriverConfig::default());
        let v = volume("pvc-1");

        driver.create(&v).await.unwrap();
        driver.create(&v).await.unwrap();
        assert!(driver.has_volume(&v.internal_name));

        driver.destroy(&v).await.unwrap();
        driver.destroy(&v).await.unwrap();
        assert!(!driver.has_volume(&v.internal_name));
        assert_eq!(driver.call_count(FakeOp::Destroy), 2);
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once() {
        let driver = FakeDriver::new(FakeDriverConfig::default());
        let v = volume("pvc-1");

        driver.fail_next(FakeOp::Create, 1);
        assert!(driver.create(&v).await.is_err());
        assert!(driver.create(&v).await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_returns_iscsi_target_for_block() {
        let driver = FakeDriver::new(FakeDriverConfig::default());
        let v = volume("pvc-1");
        driver.create(&v).await.unwrap();

        let node = Node {
            name: "worker-1".into(),
            iqn: None,
            ips: vec![],
        };
        let info = driver.publish(&v, &node).await.unwrap();
        assert_eq!(info.target_portal.as_deref(), Some("127.0.0.1:3260"));
        assert_eq!(info.lun, Some(0));
        assert!(driver.is_published(&v.internal_name, "worker-1"));
    }

    #[tokio::test]
    async fn test_import_consumes_unmanaged_volume() {
        let driver = FakeDriver::new(FakeDriverConfig::default());
        driver.add_unmanaged_volume("lun-7", 5 << 30);
        let v = volume("pvc-imported");

        assert_eq!(driver.import("lun-7", &v).await.unwrap(), 5 << 30);
        assert!(driver.import("lun-7", &v).await.is_err());
    }
}
