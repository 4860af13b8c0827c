//! Backend Registry
//!
//! In-process source of truth for backend state. Backends are kept in
//! registration order, which the matcher relies on for deterministic
//! tie-breaking. Locks are never held across an `.await`.

use crate::domain::{Backend, BackendState};
use crate::error::{Error, Result};
use crate::registry::RegistryEvent;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

// =============================================================================
// Backend Registry
// =============================================================================

pub struct BackendRegistry {
    /// Backends by UUID, in registration order
    backends: RwLock<IndexMap<Uuid, Backend>>,
    /// Names of non-deleted volumes referencing each backend
    volume_refs: RwLock<HashMap<Uuid, BTreeSet<String>>>,
    /// Next registration order to hand out
    next_order: AtomicU64,
    /// Event broadcaster
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl BackendRegistry {
    pub fn new() -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(1024);
        Arc::new(Self {
            backends: RwLock::new(IndexMap::new()),
            volume_refs: RwLock::new(HashMap::new()),
            next_order: AtomicU64::new(0),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Reserve a registration order for a backend about to be added
    pub fn next_registration_order(&self) -> u64 {
        self.next_order.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a backend. UUIDs are immutable and never reused.
    pub fn register(&self, backend: Backend) -> Result<()> {
        let uuid = backend.uuid;
        let name = backend.name.clone();
        let pool_count = backend.storage_pools.len();

        {
            let mut backends = self.backends.write();
            if backends.contains_key(&uuid) {
                return Err(Error::DuplicateUuid {
                    uuid: uuid.to_string(),
                });
            }
            // Keep handing out orders above anything loaded from the store
            self.next_order
                .fetch_max(backend.registration_order + 1, Ordering::SeqCst);
            backends.insert(uuid, backend);
        }

        info!("Registered backend {} ({})", name, uuid);
        let _ = self.event_sender.send(RegistryEvent::BackendRegistered {
            uuid,
            name,
            pool_count,
        });
        Ok(())
    }

    pub fn lookup(&self, uuid: &Uuid) -> Option<Backend> {
        self.backends.read().get(uuid).cloned()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Backend> {
        self.backends
            .read()
            .values()
            .find(|b| b.name == name)
            .cloned()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.backends.read().contains_key(uuid)
    }

    /// Move a backend to `state`, enforcing the transition table
    pub fn update_state(&self, uuid: &Uuid, state: BackendState) -> Result<Backend> {
        let (from, updated) = {
            let mut backends = self.backends.write();
            let backend = backends.get_mut(uuid).ok_or_else(|| Error::UnknownBackend {
                uuid: uuid.to_string(),
            })?;
            let from = transition(backend, state)?;
            (from, backend.clone())
        };
        self.announce_state(&updated, from);
        Ok(updated)
    }

    /// Fence a backend off from new volumes, provided none reference it.
    /// The reference check and the move to `Deleting` happen under one lock,
    /// so a concurrent `claim_volume_ref` either lands first and blocks the
    /// deletion or sees `Deleting` and fails.
    pub fn begin_deletion(&self, uuid: &Uuid) -> Result<Backend> {
        let (from, updated) = {
            let mut backends = self.backends.write();
            let backend = backends.get_mut(uuid).ok_or_else(|| Error::UnknownBackend {
                uuid: uuid.to_string(),
            })?;
            let in_use = self
                .volume_refs
                .read()
                .get(uuid)
                .map(|v| v.len())
                .unwrap_or(0);
            if in_use > 0 {
                return Err(Error::BackendInUse {
                    uuid: uuid.to_string(),
                    volumes: in_use,
                });
            }
            let from = transition(backend, BackendState::Deleting)?;
            (from, backend.clone())
        };
        self.announce_state(&updated, from);
        Ok(updated)
    }

    fn announce_state(&self, backend: &Backend, from: BackendState) {
        if from != backend.state {
            debug!("Backend {} state {} -> {}", backend.name, from, backend.state);
            let _ = self.event_sender.send(RegistryEvent::BackendStateChanged {
                uuid: backend.uuid,
                from,
                to: backend.state,
            });
        }
    }

    /// Replace a backend's pools after re-initialization
    pub fn update_pools(&self, uuid: &Uuid, pools: Vec<crate::domain::StoragePool>) -> Result<()> {
        let mut backends = self.backends.write();
        let backend = backends.get_mut(uuid).ok_or_else(|| Error::UnknownBackend {
            uuid: uuid.to_string(),
        })?;
        backend.storage_pools = pools;
        Ok(())
    }

    /// Remove a backend no volume references any more
    pub fn remove(&self, uuid: &Uuid) -> Result<Backend> {
        let removed = {
            // Same lock order as `claim_volume_ref`: backends, then refs
            let mut backends = self.backends.write();
            let mut refs = self.volume_refs.write();
            let in_use = refs.get(uuid).map(|v| v.len()).unwrap_or(0);
            if in_use > 0 {
                return Err(Error::BackendInUse {
                    uuid: uuid.to_string(),
                    volumes: in_use,
                });
            }
            let removed = backends.shift_remove(uuid).ok_or_else(|| Error::UnknownBackend {
                uuid: uuid.to_string(),
            })?;
            refs.remove(uuid);
            removed
        };

        info!("Removed backend {} ({})", removed.name, removed.uuid);
        let _ = self.event_sender.send(RegistryEvent::BackendRemoved {
            uuid: removed.uuid,
            name: removed.name.clone(),
        });
        Ok(removed)
    }

    /// All backends in registration order
    pub fn snapshot(&self) -> Vec<Backend> {
        self.backends.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.backends.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.read().is_empty()
    }

    // =========================================================================
    // Volume References
    // =========================================================================

    /// Record an existing volume's reference, as found in the store
    pub fn add_volume_ref(&self, uuid: &Uuid, volume: &str) {
        let inserted = self
            .volume_refs
            .write()
            .entry(*uuid)
            .or_default()
            .insert(volume.to_string());
        self.announce_attached(uuid, volume, inserted);
    }

    /// Reference a backend for a volume about to be created on it. Fails if
    /// the backend is gone or being deleted.
    pub fn claim_volume_ref(&self, uuid: &Uuid, volume: &str) -> Result<()> {
        let inserted = {
            let backends = self.backends.read();
            let backend = backends.get(uuid).ok_or_else(|| Error::UnknownBackend {
                uuid: uuid.to_string(),
            })?;
            if backend.state == BackendState::Deleting {
                return Err(Error::BackendNotOnline {
                    uuid: uuid.to_string(),
                    state: backend.state.to_string(),
                });
            }
            self.volume_refs
                .write()
                .entry(*uuid)
                .or_default()
                .insert(volume.to_string())
        };
        self.announce_attached(uuid, volume, inserted);
        Ok(())
    }

    fn announce_attached(&self, uuid: &Uuid, volume: &str, inserted: bool) {
        if inserted {
            let _ = self.event_sender.send(RegistryEvent::VolumeAttached {
                uuid: *uuid,
                volume: volume.to_string(),
            });
        }
    }

    pub fn remove_volume_ref(&self, uuid: &Uuid, volume: &str) {
        let removed = self
            .volume_refs
            .write()
            .get_mut(uuid)
            .map(|set| set.remove(volume))
            .unwrap_or(false);
        if removed {
            let _ = self.event_sender.send(RegistryEvent::VolumeDetached {
                uuid: *uuid,
                volume: volume.to_string(),
            });
        }
    }

    pub fn volume_count(&self, uuid: &Uuid) -> usize {
        self.volume_refs
            .read()
            .get(uuid)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

/// Apply the transition table, returning the previous state
fn transition(backend: &mut Backend, state: BackendState) -> Result<BackendState> {
    let from = backend.state;
    if !from.can_transition_to(state) {
        return Err(Error::InvalidStateTransition {
            kind: "Backend".into(),
            name: backend.name.clone(),
            from: from.to_string(),
            to: state.to_string(),
        });
    }
    backend.state = state;
    Ok(from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config_fingerprint;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn backend(name: &str, order: u64) -> Backend {
        Backend {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            driver_name: "fake".into(),
            config_fingerprint: config_fingerprint(&serde_json::Value::Null),
            state: BackendState::Online,
            multi_node: false,
            config: serde_json::Value::Null,
            registration_order: order,
            storage_pools: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = BackendRegistry::new();
        let b = backend("b1", 0);
        let uuid = b.uuid;
        registry.register(b).unwrap();

        assert_eq!(registry.lookup(&uuid).unwrap().name, "b1");
        assert_eq!(registry.lookup_by_name("b1").unwrap().uuid, uuid);
        assert!(registry.lookup(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_duplicate_uuid_rejected() {
        let registry = BackendRegistry::new();
        let b = backend("b1", 0);
        let mut dup = backend("b2", 1);
        dup.uuid = b.uuid;

        registry.register(b).unwrap();
        assert_matches!(registry.register(dup), Err(Error::DuplicateUuid { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_preserves_registration_order() {
        let registry = BackendRegistry::new();
        for (i, name) in ["zeta", "alpha", "mid"].iter().enumerate() {
            registry.register(backend(name, i as u64)).unwrap();
        }
        let names: Vec<String> = registry.snapshot().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(registry.next_registration_order(), 3);
    }

    #[test]
    fn test_update_state_enforces_transitions() {
        let registry = BackendRegistry::new();
        let b = backend("b1", 0);
        let uuid = b.uuid;
        registry.register(b).unwrap();

        registry.update_state(&uuid, BackendState::Offline).unwrap();
        registry.update_state(&uuid, BackendState::Deleting).unwrap();
        assert_matches!(
            registry.update_state(&uuid, BackendState::Online),
            Err(Error::InvalidStateTransition { .. })
        );
        assert_matches!(
            registry.update_state(&Uuid::new_v4(), BackendState::Online),
            Err(Error::UnknownBackend { .. })
        );
    }

    #[test]
    fn test_remove_refuses_referenced_backend() {
        let registry = BackendRegistry::new();
        let b = backend("b1", 0);
        let uuid = b.uuid;
        registry.register(b).unwrap();

        registry.add_volume_ref(&uuid, "pvc-1");
        assert_matches!(
            registry.remove(&uuid),
            Err(Error::BackendInUse { volumes: 1, .. })
        );

        registry.remove_volume_ref(&uuid, "pvc-1");
        registry.remove(&uuid).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_deletion_and_claims_exclude_each_other() {
        let registry = BackendRegistry::new();
        let b = backend("b1", 0);
        let uuid = b.uuid;
        registry.register(b).unwrap();

        // A claim taken first blocks the deletion
        registry.claim_volume_ref(&uuid, "pvc-1").unwrap();
        assert_matches!(
            registry.begin_deletion(&uuid),
            Err(Error::BackendInUse { volumes: 1, .. })
        );
        assert_eq!(registry.lookup(&uuid).unwrap().state, BackendState::Online);

        // Once fenced, no new volume can reference it
        registry.remove_volume_ref(&uuid, "pvc-1");
        registry.begin_deletion(&uuid).unwrap();
        assert_matches!(
            registry.claim_volume_ref(&uuid, "pvc-2"),
            Err(Error::BackendNotOnline { .. })
        );
        assert_eq!(registry.volume_count(&uuid), 0);
        assert_matches!(
            registry.claim_volume_ref(&Uuid::new_v4(), "pvc-3"),
            Err(Error::UnknownBackend { .. })
        );
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let registry = BackendRegistry::new();
        let mut events = registry.subscribe();
        let b = backend("b1", 0);
        let uuid = b.uuid;

        registry.register(b).unwrap();
        registry.update_state(&uuid, BackendState::Offline).unwrap();

        assert_matches!(events.recv().await.unwrap(), RegistryEvent::BackendRegistered { .. });
        assert_matches!(
            events.recv().await.unwrap(),
            RegistryEvent::BackendStateChanged {
                to: BackendState::Offline,
                ..
            }
        );
    }
}
