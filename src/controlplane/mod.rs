//! Control Plane Module
//!
//! The lifecycle manager, its bootstrap sequence, the REST API and the
//! storage driver factory.

pub mod api;
pub mod backends;
pub mod bootstrap;
pub mod orchestrator;

pub use api::*;
pub use backends::*;
pub use bootstrap::*;
pub use orchestrator::*;
