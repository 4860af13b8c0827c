//! Domain Ports - Trait definitions for the orchestrator's collaborators
//!
//! These traits define the boundaries between the orchestration engine and
//! external systems: array drivers, the node's iSCSI initiator, LUKS devices
//! and passphrase storage. Adapters implement them; tests use doubles.

use crate::domain::model::{
    LuksRef, Node, SessionState, StoragePool, Volume, VolumePublication,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// Storage Driver Port
// =============================================================================

/// Data path details returned by a publish
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishInfo {
    /// iSCSI target portal (`host:port`)
    pub target_portal: Option<String>,
    /// iSCSI target IQN
    pub target_iqn: Option<String>,
    pub lun: Option<u32>,
    /// NFS export path for file volumes
    pub export_path: Option<String>,
}

/// Port for one storage array backend
///
/// Drivers are created per backend and must treat repeated calls for the same
/// volume as idempotent: transaction replay re-executes Redo operations.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Driver identifier, e.g. `fake`
    fn driver_name(&self) -> &str;

    /// Whether the array can attach one volume to several nodes
    fn multi_node(&self) -> bool;

    /// Pools this backend exposes, stamped with the owning backend UUID
    fn storage_pools(&self, backend_uuid: Uuid) -> Vec<StoragePool>;

    /// Validate the configuration and connect to the array
    async fn initialize(&self) -> Result<()>;

    /// Create a volume. Creating an already existing volume succeeds.
    async fn create(&self, volume: &Volume) -> Result<()>;

    /// Create `clone` from `source`, optionally from one of its snapshots
    async fn create_clone(
        &self,
        source: &Volume,
        clone: &Volume,
        snapshot: Option<&str>,
    ) -> Result<()>;

    /// Adopt an existing array volume, returning its size in bytes
    async fn import(&self, original_name: &str, volume: &Volume) -> Result<u64>;

    /// Grow a volume to `new_size_bytes`
    async fn resize(&self, volume: &Volume, new_size_bytes: u64) -> Result<()>;

    /// Destroy a volume. Destroying an absent volume succeeds.
    async fn destroy(&self, volume: &Volume) -> Result<()>;

    /// Grant `node` access to the volume
    async fn publish(&self, volume: &Volume, node: &Node) -> Result<PublishInfo>;

    /// Revoke access. Revoking absent access succeeds.
    async fn unpublish(&self, volume: &Volume, node: &Node) -> Result<()>;

    /// Take a snapshot, returning its size in bytes
    async fn create_snapshot(&self, volume: &Volume, snapshot: &str) -> Result<u64>;

    /// Delete a snapshot. Deleting an absent snapshot succeeds.
    async fn delete_snapshot(&self, volume: &Volume, snapshot: &str) -> Result<()>;

    /// Check array connectivity
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Node Session Ports
// =============================================================================

/// One iSCSI session as seen from a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTarget {
    pub node_name: String,
    pub target_portal: String,
    pub iqn: String,
}

impl std::fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} ({})", self.iqn, self.target_portal, self.node_name)
    }
}

/// Port for the node's iSCSI initiator
#[async_trait]
pub trait IscsiClient: Send + Sync {
    /// Classify the session for `target`
    async fn inspect(&self, target: &SessionTarget) -> Result<SessionState>;

    /// Establish a session
    async fn login(&self, target: &SessionTarget) -> Result<()>;

    /// Tear down a session. Logging out of an absent session succeeds.
    async fn logout(&self, target: &SessionTarget) -> Result<()>;
}

/// A block device that may carry a LUKS header
#[async_trait]
pub trait LuksDevice: Send + Sync {
    fn device_path(&self) -> &str;

    async fn is_luks_formatted(&self) -> Result<bool>;

    async fn is_open(&self) -> Result<bool>;

    /// Destructive. Callers must check `is_luks_formatted` first.
    async fn luks_format(&self, passphrase: &str) -> Result<()>;

    async fn open(&self, passphrase: &str) -> Result<()>;
}

/// Resolves the LUKS device backing a published volume
pub trait LuksDeviceProvider: Send + Sync {
    fn device_for(&self, volume: &Volume, publication: &VolumePublication) -> Arc<dyn LuksDevice>;
}

/// Resolves passphrases referenced by encrypted volumes
#[async_trait]
pub trait PassphraseSource: Send + Sync {
    async fn passphrase(&self, luks: &LuksRef) -> Result<String>;
}

// =============================================================================
// Lifecycle Port for the Healing Loop
// =============================================================================

/// A published volume as seen by the healing loop
#[derive(Debug, Clone)]
pub struct PublishedVolume {
    pub volume: Volume,
    pub publication: VolumePublication,
}

/// The healing loop's view of the lifecycle manager
///
/// Reads are short in-memory snapshots. Session repair is host-side only and
/// never changes a volume's lifecycle state.
pub trait PublicationSource: Send + Sync {
    /// Online volumes with iSCSI publications, optionally limited to one node
    fn iscsi_publications(&self, node_name: Option<&str>) -> Vec<PublishedVolume>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageDriverRef = Arc<dyn StorageDriver>;
pub type IscsiClientRef = Arc<dyn IscsiClient>;
pub type LuksDeviceRef = Arc<dyn LuksDevice>;
pub type LuksDeviceProviderRef = Arc<dyn LuksDeviceProvider>;
pub type PassphraseSourceRef = Arc<dyn PassphraseSource>;
pub type PublicationSourceRef = Arc<dyn PublicationSource>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_target_display() {
        let target = SessionTarget {
            node_name: "worker-1".into(),
            target_portal: "10.0.0.5:3260".into(),
            iqn: "iqn.1992-08.com.example:sn.1".into(),
        };
        assert_eq!(
            target.to_string(),
            "iqn.1992-08.com.example:sn.1@10.0.0.5:3260 (worker-1)"
        );
    }

    #[test]
    fn test_publish_info_defaults_empty() {
        let info = PublishInfo::default();
        assert!(info.target_portal.is_none());
        assert!(info.lun.is_none());
    }
}
