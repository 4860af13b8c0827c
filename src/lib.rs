//! Volume Orchestrator
//!
//! A storage orchestration engine: it owns the lifecycle of volumes across
//! heterogeneous storage backends, matches requests to eligible backend
//! pools, journals every mutating operation so a crash can be recovered, and
//! keeps the iSCSI sessions behind published volumes healthy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           REST API (axum)                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                     Volume Lifecycle Manager                            │
//! │  ┌────────────────┐  ┌─────────────────┐  ┌──────────────────────────┐  │
//! │  │    Matcher     │  │ Backend Registry│  │     Transaction Log      │  │
//! │  └────────────────┘  └─────────────────┘  └──────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  Bootstrap Sequencer (connect → schema gate → load → replay → ready)    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │   Persistent Store (memory | file | Kubernetes custom resources)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           ▲                                             │
//!           │ publications                                ▼ drivers
//! ┌─────────┴───────────────┐               ┌───────────────────────────────┐
//! │ Session Self-Healing    │               │ Storage drivers (arrays)      │
//! │ (iscsiadm, cryptsetup)  │               └───────────────────────────────┘
//! └─────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: lifecycle manager, bootstrap, REST API, drivers
//! - [`store`]: persistent store clients, key layout, schema gate
//! - [`txn`]: transaction log
//! - [`registry`]: backend registry
//! - [`matcher`]: storage class matching
//! - [`healing`]: iSCSI session and LUKS self-healing
//! - [`domain`]: core types and ports
//! - [`error`]: error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod healing;
pub mod matcher;
pub mod metrics;
pub mod registry;
pub mod store;
pub mod txn;

// Re-export commonly used types
pub use config::{BootstrapConfig, HealingConfig, OrchestratorConfig, PlatformConfig};

pub use controlplane::{
    ApiServer, ApiServerConfig, BackendFactory, BootstrapReport, Orchestrator, RequestContext,
    RestRouter,
};

pub use domain::{
    AccessMode, Backend, BackendSpec, BackendState, CloneRequest, ImportRequest, Node, Protocol,
    Snapshot, StorageClass, Volume, VolumeMode, VolumePublication, VolumeRequest, VolumeState,
};

pub use error::{Error, ErrorAction, Result};

pub use healing::{PassReport, SessionSelfHealer};

pub use metrics::Metrics;

pub use store::{FileStore, InMemoryStore, KubeStore, StoreClient, StoreRef};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
