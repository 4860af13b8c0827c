//! Transaction operations and records

use crate::domain::{Backend, Snapshot, Volume};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Operations
// =============================================================================

/// A mutating operation with everything needed to replay it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "payload", rename_all_fields = "camelCase")]
pub enum TxnOp {
    AddVolume {
        volume: Volume,
    },
    DeleteVolume {
        volume: Volume,
    },
    /// `volume` carries the size before the resize
    ResizeVolume {
        volume: Volume,
        new_size_bytes: u64,
    },
    CloneVolume {
        source: Volume,
        volume: Volume,
        snapshot: Option<String>,
    },
    ImportVolume {
        original_name: String,
        volume: Volume,
    },
    AddBackend {
        backend: Backend,
    },
    DeleteBackend {
        backend: Backend,
    },
    AddSnapshot {
        volume: Volume,
        snapshot: Snapshot,
    },
    DeleteSnapshot {
        volume: Volume,
        snapshot: Snapshot,
    },
}

/// How an interrupted operation is resolved at restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Idempotency {
    /// Re-execute, then commit
    Redo,
    /// Mark rolled back and move the entity to `Error`
    RollBack,
}

impl TxnOp {
    pub fn idempotency(&self) -> Idempotency {
        match self {
            TxnOp::AddVolume { .. }
            | TxnOp::DeleteVolume { .. }
            | TxnOp::ResizeVolume { .. }
            | TxnOp::AddBackend { .. }
            | TxnOp::DeleteBackend { .. }
            | TxnOp::AddSnapshot { .. }
            | TxnOp::DeleteSnapshot { .. } => Idempotency::Redo,
            TxnOp::CloneVolume { .. } | TxnOp::ImportVolume { .. } => Idempotency::RollBack,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxnOp::AddVolume { .. } => "AddVolume",
            TxnOp::DeleteVolume { .. } => "DeleteVolume",
            TxnOp::ResizeVolume { .. } => "ResizeVolume",
            TxnOp::CloneVolume { .. } => "CloneVolume",
            TxnOp::ImportVolume { .. } => "ImportVolume",
            TxnOp::AddBackend { .. } => "AddBackend",
            TxnOp::DeleteBackend { .. } => "DeleteBackend",
            TxnOp::AddSnapshot { .. } => "AddSnapshot",
            TxnOp::DeleteSnapshot { .. } => "DeleteSnapshot",
        }
    }

    /// The entity this operation mutates; at most one pending transaction
    /// may exist per target
    pub fn target_id(&self) -> String {
        match self {
            TxnOp::AddVolume { volume }
            | TxnOp::DeleteVolume { volume }
            | TxnOp::ResizeVolume { volume, .. }
            | TxnOp::CloneVolume { volume, .. }
            | TxnOp::ImportVolume { volume, .. } => volume_target(&volume.name),
            TxnOp::AddBackend { backend } | TxnOp::DeleteBackend { backend } => {
                backend_target(&backend.name)
            }
            TxnOp::AddSnapshot { snapshot, .. } | TxnOp::DeleteSnapshot { snapshot, .. } => {
                snapshot_target(&snapshot.volume_name, &snapshot.name)
            }
        }
    }

    /// Volume this operation reads from while pending; it must not be
    /// deleted until the operation resolves
    pub fn source_target(&self) -> Option<String> {
        match self {
            TxnOp::CloneVolume { source, .. } => Some(volume_target(&source.name)),
            _ => None,
        }
    }
}

pub fn volume_target(name: &str) -> String {
    format!("volume/{}", name)
}

pub fn backend_target(name: &str) -> String {
    format!("backend/{}", name)
}

pub fn snapshot_target(volume: &str, name: &str) -> String {
    format!("snapshot/{}/{}", volume, name)
}

// =============================================================================
// Transaction Record
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Committed,
    RolledBack,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "Pending"),
            TransactionStatus::Committed => write!(f, "Committed"),
            TransactionStatus::RolledBack => write!(f, "RolledBack"),
        }
    }
}

/// Persisted record of one operation's intent and outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub operation: TxnOp,
    pub target_id: String,
    pub status: TransactionStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn pending(operation: TxnOp) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target_id: operation.target_id(),
            operation,
            status: TransactionStatus::Pending,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TransactionStatus::Pending
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::domain::*;
    use chrono::Utc;
    use uuid::Uuid;

    pub fn volume(name: &str) -> Volume {
        Volume {
            name: name.to_string(),
            internal_name: format!("vorch_{}", name),
            backend_uuid: Uuid::nil(),
            pool: "pool-a".into(),
            size_bytes: 1 << 30,
            protocol: Protocol::Block,
            access_mode: AccessMode::ReadWriteOnce,
            volume_mode: VolumeMode::Filesystem,
            state: VolumeState::Creating,
            luks: None,
            storage_class: None,
            clone_source: None,
            imported: false,
            created_at: Utc::now(),
        }
    }
}
