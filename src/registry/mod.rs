//! Backend Registry
//!
//! In-memory index of backends by UUID, in registration order.

mod backend_registry;
mod events;

pub use backend_registry::BackendRegistry;
pub use events::RegistryEvent;
