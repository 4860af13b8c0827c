//! Domain layer - Core model and port definitions
//!
//! This module defines the orchestrator's entities and the traits (ports)
//! that adapters implement, following hexagonal architecture principles.

pub mod access_mode;
pub mod model;
pub mod naming;
pub mod ports;
pub mod version;

pub use access_mode::CsiAccessMode;
pub use model::*;
pub use naming::{derive_internal_name, resolve_storage_prefix, resolve_storage_prefix_text};
pub use ports::*;
pub use version::{check_platform_version, PlatformVersion};
