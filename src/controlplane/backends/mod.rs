//! Storage Backend Drivers
//!
//! Provides the driver factory and the in-memory `fake` driver. Vendor array
//! drivers plug in by implementing `StorageDriver` and registering with the
//! factory.

pub mod fake;

pub use fake::*;

use crate::domain::ports::StorageDriverRef;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Factory for creating storage drivers
///
/// Drivers registered for a specific backend name take precedence over the
/// built-in drivers, which lets callers hand in preconfigured instances.
#[derive(Default)]
pub struct BackendFactory {
    overrides: RwLock<HashMap<String, StorageDriverRef>>,
}

impl BackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `driver` for the backend named `backend_name`
    pub fn with_driver(self, backend_name: &str, driver: StorageDriverRef) -> Self {
        self.register_driver(backend_name, driver);
        self
    }

    pub fn register_driver(&self, backend_name: &str, driver: StorageDriverRef) {
        self.overrides
            .write()
            .insert(backend_name.to_string(), driver);
    }

    /// Create the driver for a backend
    pub fn create(
        &self,
        backend_name: &str,
        driver_name: &str,
        config: &serde_json::Value,
    ) -> Result<StorageDriverRef> {
        if let Some(driver) = self.overrides.read().get(backend_name) {
            return Ok(driver.clone());
        }

        match driver_name.to_lowercase().as_str() {
            FAKE_DRIVER_NAME | "memory" => Ok(Arc::new(FakeDriver::from_config(config)?)),
            other => Err(Error::Configuration(format!(
                "unknown storage driver '{}' for backend {}",
                other, backend_name
            ))),
        }
    }
}
