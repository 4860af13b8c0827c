//! Registry Events
//!
//! Events emitted by the backend registry for consumers that react to backend
//! lifecycle changes.

use crate::domain::BackendState;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted by the backend registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A backend was registered
    BackendRegistered {
        uuid: Uuid,
        name: String,
        pool_count: usize,
    },

    /// A backend was removed
    BackendRemoved { uuid: Uuid, name: String },

    /// A backend changed state
    BackendStateChanged {
        uuid: Uuid,
        from: BackendState,
        to: BackendState,
    },

    /// A volume started referencing a backend
    VolumeAttached { uuid: Uuid, volume: String },

    /// A volume stopped referencing a backend
    VolumeDetached { uuid: Uuid, volume: String },
}

impl RegistryEvent {
    /// Get the backend UUID associated with this event
    pub fn backend_uuid(&self) -> Uuid {
        match self {
            RegistryEvent::BackendRegistered { uuid, .. }
            | RegistryEvent::BackendRemoved { uuid, .. }
            | RegistryEvent::BackendStateChanged { uuid, .. }
            | RegistryEvent::VolumeAttached { uuid, .. }
            | RegistryEvent::VolumeDetached { uuid, .. } => *uuid,
        }
    }

    /// Check if this event changes which backends are eligible for matching
    pub fn affects_matching(&self) -> bool {
        matches!(
            self,
            RegistryEvent::BackendRegistered { .. }
                | RegistryEvent::BackendRemoved { .. }
                | RegistryEvent::BackendStateChanged { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_backend_uuid() {
        let uuid = Uuid::new_v4();
        let event = RegistryEvent::BackendStateChanged {
            uuid,
            from: BackendState::Online,
            to: BackendState::Offline,
        };
        assert_eq!(event.backend_uuid(), uuid);
        assert!(event.affects_matching());

        let event = RegistryEvent::VolumeAttached {
            uuid,
            volume: "pvc-1".into(),
        };
        assert!(!event.affects_matching());
    }
}
