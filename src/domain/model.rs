//! Domain Model
//!
//! Backends, storage pools, storage classes, volumes, nodes and the state
//! machines that govern them. Every record here is persisted as JSON, so new
//! optional fields carry `#[serde(default)]` and unknown fields are ignored.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// Protocol
// =============================================================================

/// Data path protocol offered by a pool or requested by a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// NAS (NFS/SMB)
    File,
    /// SAN (iSCSI)
    Block,
    /// Wildcard, only meaningful in requests
    #[serde(alias = "")]
    Any,
}

impl Protocol {
    /// Whether a request for `self` can be served by a pool offering `offered`
    pub fn accepts(self, offered: Protocol) -> bool {
        match self {
            Protocol::Any => true,
            Protocol::File | Protocol::Block => self == offered,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::File => "file",
            Protocol::Block => "block",
            Protocol::Any => "any",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(Protocol::File),
            "block" => Ok(Protocol::Block),
            "any" | "" => Ok(Protocol::Any),
            other => Err(Error::Validation(format!("unknown protocol '{}'", other))),
        }
    }
}

// =============================================================================
// Access Mode / Volume Mode
// =============================================================================

/// Volume access mode as requested by the container platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

impl AccessMode {
    pub const ALL: [AccessMode; 4] = [
        AccessMode::ReadWriteOnce,
        AccessMode::ReadOnlyMany,
        AccessMode::ReadWriteMany,
        AccessMode::ReadWriteOncePod,
    ];

    /// Multi-node modes require a backend advertising multi-node attach
    pub fn is_multi_node(self) -> bool {
        matches!(self, AccessMode::ReadOnlyMany | AccessMode::ReadWriteMany)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessMode::ReadWriteOnce => "ReadWriteOnce",
            AccessMode::ReadOnlyMany => "ReadOnlyMany",
            AccessMode::ReadWriteMany => "ReadWriteMany",
            AccessMode::ReadWriteOncePod => "ReadWriteOncePod",
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "ReadWriteOnce" | "RWO" => Ok(AccessMode::ReadWriteOnce),
            "ReadOnlyMany" | "ROX" => Ok(AccessMode::ReadOnlyMany),
            "ReadWriteMany" | "RWX" => Ok(AccessMode::ReadWriteMany),
            "ReadWriteOncePod" | "RWOP" => Ok(AccessMode::ReadWriteOncePod),
            other => Err(Error::Validation(format!("unknown access mode '{}'", other))),
        }
    }
}

/// How the volume is presented to the workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    #[serde(rename = "Block")]
    RawBlock,
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeMode::Filesystem => write!(f, "Filesystem"),
            VolumeMode::RawBlock => write!(f, "Block"),
        }
    }
}

// =============================================================================
// Backend State
// =============================================================================

/// Lifecycle state of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendState {
    Online,
    Offline,
    Deleting,
    FailedToInitialize,
}

impl BackendState {
    /// Transitions only move toward `Deleting`, except `Online <-> Offline`
    /// and a successful re-initialization out of `FailedToInitialize`.
    pub fn can_transition_to(self, next: BackendState) -> bool {
        use BackendState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Online, Offline) | (Offline, Online) => true,
            (Online | Offline, FailedToInitialize) => true,
            (FailedToInitialize, Online) => true,
            (Online | Offline | FailedToInitialize, Deleting) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::Online => "online",
            BackendState::Offline => "offline",
            BackendState::Deleting => "deleting",
            BackendState::FailedToInitialize => "failedToInitialize",
        }
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Volume State
// =============================================================================

/// Lifecycle state of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeState {
    Creating,
    Online,
    Deleting,
    Deleted,
    Error,
}

impl VolumeState {
    /// `Creating -> Online -> Deleting -> Deleted`, with `Error` reachable
    /// from every non-terminal state and `Error -> Deleting` for cleanup.
    pub fn can_transition_to(self, next: VolumeState) -> bool {
        use VolumeState::*;
        if self == next {
            return !self.is_terminal();
        }
        match (self, next) {
            (Creating, Online) => true,
            (Online, Deleting) => true,
            (Deleting, Deleted) => true,
            (Error, Deleting) => true,
            (Creating | Online | Deleting, Error) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, VolumeState::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VolumeState::Creating => "creating",
            VolumeState::Online => "online",
            VolumeState::Deleting => "deleting",
            VolumeState::Deleted => "deleted",
            VolumeState::Error => "error",
        }
    }
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Pool Attributes
// =============================================================================

/// A capability a pool offers for one attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Offer {
    Bool(bool),
    Int { min: i64, max: i64 },
    Strings(BTreeSet<String>),
}

/// What a storage class or request requires of one attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    Bool(bool),
    Int(i64),
    String(String),
}

impl Offer {
    /// Check a single requirement against this offer. Mismatched kinds never
    /// satisfy.
    pub fn satisfies(&self, requirement: &Requirement) -> bool {
        match (self, requirement) {
            (Offer::Bool(offered), Requirement::Bool(required)) => *offered || !*required,
            (Offer::Int { min, max }, Requirement::Int(value)) => min <= value && value <= max,
            (Offer::Strings(values), Requirement::String(value)) => values.contains(value),
            _ => false,
        }
    }

    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Offer::Strings(values.into_iter().map(Into::into).collect())
    }
}

/// Topology segment, e.g. `topology.kubernetes.io/zone -> us-east-1a`
pub type Topology = BTreeMap<String, String>;

// =============================================================================
// Storage Pool
// =============================================================================

/// A named capacity/capability unit within a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoragePool {
    pub name: String,
    pub backend_uuid: Uuid,
    pub protocol: Protocol,
    /// Matchable capability set
    #[serde(default)]
    pub attributes: BTreeMap<String, Offer>,
    /// Supported access modes; empty means every mode
    #[serde(default)]
    pub access_modes: BTreeSet<AccessMode>,
    /// Topology this pool is reachable from; empty means everywhere
    #[serde(default)]
    pub topology: Topology,
}

impl StoragePool {
    pub fn supports_access_mode(&self, mode: AccessMode) -> bool {
        self.access_modes.is_empty() || self.access_modes.contains(&mode)
    }
}

// =============================================================================
// Backend
// =============================================================================

/// A configured connection to an external storage array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backend {
    pub uuid: Uuid,
    pub name: String,
    pub driver_name: String,
    pub config_fingerprint: String,
    pub state: BackendState,
    /// Whether the array supports attaching a volume to several nodes
    #[serde(default)]
    pub multi_node: bool,
    /// Driver configuration as supplied by the operator
    #[serde(default)]
    pub config: serde_json::Value,
    /// Position in registration order, used for deterministic matching
    #[serde(default)]
    pub registration_order: u64,
    #[serde(default)]
    pub storage_pools: Vec<StoragePool>,
    pub created_at: DateTime<Utc>,
}

impl Backend {
    /// Raw `storagePrefix` value from the driver config, if present
    pub fn storage_prefix(&self) -> Option<&serde_json::Value> {
        self.config.get("storagePrefix")
    }

    pub fn pool(&self, name: &str) -> Option<&StoragePool> {
        self.storage_pools.iter().find(|p| p.name == name)
    }
}

/// SHA-256 over the canonical JSON form of a driver config.
///
/// `serde_json` maps are key-ordered, so equal configs always serialize to
/// the same bytes.
pub fn config_fingerprint(config: &serde_json::Value) -> String {
    let canonical = serde_json::to_vec(config).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

/// Operator input for adding a backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    pub name: String,
    pub driver_name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

// =============================================================================
// Storage Class
// =============================================================================

/// Named set of predicates that select eligible pools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClass {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Requirement>,
    #[serde(default)]
    pub allowed_topologies: Vec<Topology>,
}

// =============================================================================
// Volume
// =============================================================================

/// Reference to the passphrase protecting an encrypted volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LuksRef {
    pub passphrase_name: String,
}

/// A provisioned (or provisioning) volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub internal_name: String,
    /// Weak reference into the backend registry
    pub backend_uuid: Uuid,
    pub pool: String,
    pub size_bytes: u64,
    pub protocol: Protocol,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub volume_mode: VolumeMode,
    pub state: VolumeState,
    #[serde(default)]
    pub luks: Option<LuksRef>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub clone_source: Option<String>,
    #[serde(default)]
    pub imported: bool,
    pub created_at: DateTime<Utc>,
}

impl Volume {
    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: VolumeState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                kind: "Volume".into(),
                name: self.name.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.luks.is_some()
    }

    pub fn ensure_online(&self) -> Result<()> {
        if self.state == VolumeState::Online {
            Ok(())
        } else {
            Err(Error::VolumeNotOnline {
                name: self.name.clone(),
                state: self.state.to_string(),
            })
        }
    }
}

/// Request to create a new volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    pub name: String,
    pub size_bytes: u64,
    #[serde(default = "default_protocol")]
    pub protocol: Protocol,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub volume_mode: VolumeMode,
    #[serde(default)]
    pub storage_class: Option<String>,
    /// Extra requirements on top of the storage class
    #[serde(default)]
    pub attributes: BTreeMap<String, Requirement>,
    #[serde(default)]
    pub luks: Option<LuksRef>,
}

fn default_protocol() -> Protocol {
    Protocol::Any
}

impl VolumeRequest {
    pub fn validate(&self) -> Result<()> {
        validate_name("volume", &self.name)?;
        if self.size_bytes == 0 {
            return Err(Error::Validation(format!(
                "volume {} must request a non-zero size",
                self.name
            )));
        }
        if self.volume_mode == VolumeMode::RawBlock && self.protocol == Protocol::File {
            return Err(Error::Validation(format!(
                "volume {} requests raw block mode over a file protocol",
                self.name
            )));
        }
        Ok(())
    }
}

/// Request to clone an existing volume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    pub source: String,
    pub name: String,
    #[serde(default)]
    pub snapshot: Option<String>,
}

/// Request to bring an existing array volume under management
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    pub name: String,
    pub backend_uuid: Uuid,
    pub pool: String,
    /// Name of the volume on the array
    pub original_name: String,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub volume_mode: VolumeMode,
    #[serde(default)]
    pub luks: Option<LuksRef>,
}

// =============================================================================
// Nodes and Publications
// =============================================================================

/// A worker node that volumes are published to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub iqn: Option<String>,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// Attachment of a volume to a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumePublication {
    pub volume_name: String,
    pub node_name: String,
    #[serde(default)]
    pub read_only: bool,
    pub access_mode: AccessMode,
    #[serde(default)]
    pub target_portal: Option<String>,
    #[serde(default)]
    pub target_iqn: Option<String>,
    #[serde(default)]
    pub lun: Option<u32>,
}

impl VolumePublication {
    pub fn is_iscsi(&self) -> bool {
        self.target_portal.is_some() && self.target_iqn.is_some()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotState {
    Creating,
    Online,
    Deleting,
    Error,
}

/// Point-in-time copy of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub name: String,
    pub volume_name: String,
    #[serde(default)]
    pub size_bytes: u64,
    pub state: SnapshotState,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// iSCSI Session Observation
// =============================================================================

/// Classification of a live iSCSI session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Healthy,
    Stale,
    Missing,
}

impl SessionState {
    pub fn needs_repair(self) -> bool {
        !matches!(self, SessionState::Healthy)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Healthy => write!(f, "healthy"),
            SessionState::Stale => write!(f, "stale"),
            SessionState::Missing => write!(f, "missing"),
        }
    }
}

/// Observed state of one LUKS device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LuksDeviceState {
    pub device_path: String,
    pub mapped_name: String,
    pub is_formatted: bool,
    pub is_open: bool,
}

// =============================================================================
// Validation
// =============================================================================

/// Names become store keys and REST path segments
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 253 {
        return Err(Error::Validation(format!(
            "{} name must be 1-253 characters",
            kind
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::Validation(format!(
            "{} name '{}' may only contain alphanumerics, '-', '_' and '.'",
            kind, name
        )));
    }
    Ok(())
}
