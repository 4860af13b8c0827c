//! Bootstrap Sequencer
//!
//! Runs exactly once per process, before any request is served:
//!
//! 1. connect to the store (bounded fixed-delay retry)
//! 2. schema gate
//! 3. load backends and initialize their drivers
//! 4. load volumes, storage classes, nodes, publications, snapshots
//! 5. replay pending transactions, oldest first
//! 6. compact resolved transactions and mark ready

use crate::controlplane::orchestrator::{
    Orchestrator, LIFECYCLE_BOOTSTRAPPING, LIFECYCLE_FAILED, LIFECYCLE_IDLE, LIFECYCLE_READY,
};
use crate::domain::ports::StorageDriverRef;
use crate::domain::{
    Backend, BackendState, Node, Snapshot, SnapshotState, StorageClass, Volume,
    VolumePublication, VolumeState,
};
use crate::error::{Error, Result};
use crate::store::{SchemaGate, SchemaStatus, StoreClient, StoreExt};
use crate::txn::{Idempotency, TxnOp};
use backoff::backoff::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// =============================================================================
// Connectivity Backoff
// =============================================================================

/// Fixed delay between attempts, bounded by an attempt count and an overall
/// time budget. `reset` restarts both.
#[derive(Debug, Clone)]
pub(crate) struct BoundedFixedBackoff {
    delay: Duration,
    max_attempts: u32,
    budget: Duration,
    failures: u32,
    deadline: Instant,
}

impl BoundedFixedBackoff {
    pub(crate) fn new(delay: Duration, max_attempts: u32, budget: Duration) -> Self {
        Self {
            delay,
            max_attempts,
            budget,
            failures: 0,
            deadline: Instant::now() + budget,
        }
    }
}

impl Backoff for BoundedFixedBackoff {
    fn reset(&mut self) {
        self.failures = 0;
        self.deadline = Instant::now() + self.budget;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            return None;
        }
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        Some(self.delay.min(remaining))
    }
}

// =============================================================================
// Report
// =============================================================================

/// What bootstrap found and did
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub connect_attempts: u32,
    pub schema: SchemaStatus,
    pub backends: usize,
    pub failed_backends: usize,
    pub volumes: usize,
    /// Redo transactions re-executed and committed
    pub replayed: usize,
    /// Transactions resolved as rolled back
    pub rolled_back: usize,
    pub compacted: usize,
}

// =============================================================================
// Bootstrap
// =============================================================================

impl Orchestrator {
    /// Bring the orchestrator up. A second call fails, as does a call racing
    /// one already in progress.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        if self
            .lifecycle
            .compare_exchange(
                LIFECYCLE_IDLE,
                LIFECYCLE_BOOTSTRAPPING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(Error::Internal(
                "bootstrap has already run in this process".into(),
            ));
        }

        match self.run_bootstrap().await {
            Ok(report) => {
                self.lifecycle.store(LIFECYCLE_READY, Ordering::SeqCst);
                self.refresh_gauges();
                info!(
                    "Orchestrator {} ready: {} backend(s), {} volume(s), {} replayed, {} rolled back",
                    self.config.orchestrator_name,
                    report.backends,
                    report.volumes,
                    report.replayed,
                    report.rolled_back
                );
                Ok(report)
            }
            Err(e) => {
                self.lifecycle.store(LIFECYCLE_FAILED, Ordering::SeqCst);
                error!("Bootstrap failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_bootstrap(&self) -> Result<BootstrapReport> {
        info!(
            "Bootstrapping orchestrator {} on {} store",
            self.config.orchestrator_name,
            self.store.kind()
        );

        let connect_attempts = self.connect().await?;

        let gate = SchemaGate::new(self.store.as_ref(), &self.keys, self.config.api_version);
        let (schema, version) = gate.check().await?;
        debug!("Schema gate passed: {:?}", schema);

        let (backends, failed_backends) = self.load_backends().await?;
        let volumes = self.load_volumes().await?;
        self.load_storage_classes().await?;
        self.load_nodes().await?;
        self.load_publications().await?;
        self.load_snapshots().await?;

        let (replayed, rolled_back) = self.replay_transactions().await?;
        self.reconcile_stranded().await;

        let compacted = self.txn_log.compact().await?;
        gate.mark_publications_synced(&version).await?;

        Ok(BootstrapReport {
            connect_attempts,
            schema,
            backends,
            failed_backends,
            volumes,
            replayed,
            rolled_back,
            compacted,
        })
    }

    /// Probe the store until it answers, returning the attempts used
    async fn connect(&self) -> Result<u32> {
        let settings = &self.config.bootstrap;
        let budget_end = Instant::now() + settings.timeout();
        let policy = BoundedFixedBackoff::new(
            settings.retry_delay(),
            settings.max_attempts,
            settings.timeout(),
        );

        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let store = &self.store;
        let root = self.keys.root();

        let connected = backoff::future::retry_notify(
            policy,
            || async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                let remaining = budget_end.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, store.health_check()).await {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err(backoff::Error::transient(Error::store_unavailable(
                        "healthCheck",
                        root,
                        "store reported unhealthy",
                    ))),
                    Ok(Err(e)) => Err(backoff::Error::transient(e)),
                    Err(_) => Err(backoff::Error::transient(Error::store_unavailable(
                        "healthCheck",
                        root,
                        "attempt exceeded the remaining bootstrap budget",
                    ))),
                }
            },
            |e, wait| warn!("Store not reachable ({}), retrying in {:?}", e, wait),
        )
        .await;

        let used = counter.load(Ordering::SeqCst);
        match connected {
            Ok(()) => {
                info!("Connected to store after {} attempt(s)", used);
                Ok(used)
            }
            Err(e) => Err(Error::BootstrapFailed {
                attempts: used,
                reason: e.to_string(),
            }),
        }
    }

    // =========================================================================
    // Loading
    // =========================================================================

    async fn start_driver(&self, backend: &Backend) -> Result<StorageDriverRef> {
        let driver = self
            .factory
            .create(&backend.name, &backend.driver_name, &backend.config)?;
        driver.initialize().await?;
        Ok(driver)
    }

    async fn load_backends(&self) -> Result<(usize, usize)> {
        let mut backends: Vec<Backend> = self
            .store
            .list_records::<Backend>(&self.keys.backends())
            .await?
            .into_iter()
            .map(|(_, backend)| backend)
            .collect();
        backends.sort_by(|a, b| {
            a.registration_order
                .cmp(&b.registration_order)
                .then(a.uuid.cmp(&b.uuid))
        });

        let total = backends.len();
        let mut failed = 0;
        for mut backend in backends {
            let previous = backend.state;
            match self.start_driver(&backend).await {
                Ok(driver) => {
                    backend.storage_pools = driver.storage_pools(backend.uuid);
                    backend.multi_node = driver.multi_node();
                    if backend.state == BackendState::FailedToInitialize {
                        backend.state = BackendState::Online;
                    }
                    self.drivers.write().insert(backend.uuid, driver);
                }
                Err(e) => {
                    warn!("Backend {} failed to initialize: {}", backend.name, e);
                    if backend.state != BackendState::Deleting {
                        backend.state = BackendState::FailedToInitialize;
                    }
                    failed += 1;
                }
            }
            if backend.state != previous {
                self.store
                    .put_record(&self.keys.backend(&backend.uuid), &backend)
                    .await?;
            }
            self.registry.register(backend)?;
        }
        Ok((total, failed))
    }

    async fn load_volumes(&self) -> Result<usize> {
        let volumes: Vec<(String, Volume)> =
            self.store.list_records(&self.keys.volumes()).await?;
        let total = volumes.len();

        for (_, mut volume) in volumes {
            if self.registry.contains(&volume.backend_uuid) {
                self.registry
                    .add_volume_ref(&volume.backend_uuid, &volume.name);
            } else if volume.state != VolumeState::Error {
                warn!(
                    "Volume {} references missing backend {}",
                    volume.name, volume.backend_uuid
                );
                if volume.transition(VolumeState::Error).is_ok() {
                    self.store
                        .put_record(&self.keys.volume(&volume.internal_name), &volume)
                        .await?;
                }
            }
            self.volumes.write().insert(volume.name.clone(), volume);
        }
        Ok(total)
    }

    async fn load_storage_classes(&self) -> Result<()> {
        let classes: Vec<(String, StorageClass)> =
            self.store.list_records(&self.keys.storage_classes()).await?;
        let mut index = self.storage_classes.write();
        for (_, class) in classes {
            index.insert(class.name.clone(), class);
        }
        Ok(())
    }

    async fn load_nodes(&self) -> Result<()> {
        let nodes: Vec<(String, Node)> = self.store.list_records(&self.keys.nodes()).await?;
        let mut index = self.nodes.write();
        for (_, node) in nodes {
            index.insert(node.name.clone(), node);
        }
        Ok(())
    }

    async fn load_publications(&self) -> Result<()> {
        let publications: Vec<(String, VolumePublication)> =
            self.store.list_records(&self.keys.publications()).await?;
        let mut index = self.publications.write();
        for (_, publication) in publications {
            index.insert(
                (publication.volume_name.clone(), publication.node_name.clone()),
                publication,
            );
        }
        Ok(())
    }

    async fn load_snapshots(&self) -> Result<()> {
        let snapshots: Vec<(String, Snapshot)> =
            self.store.list_records(&self.keys.snapshots()).await?;
        let mut index = self.snapshots.write();
        for (_, snapshot) in snapshots {
            index.insert(
                (snapshot.volume_name.clone(), snapshot.name.clone()),
                snapshot,
            );
        }
        Ok(())
    }

    // =========================================================================
    // Transaction Replay
    // =========================================================================

    async fn replay_transactions(&self) -> Result<(usize, usize)> {
        let pending = self.txn_log.list_pending().await?;
        if !pending.is_empty() {
            info!("Replaying {} pending transaction(s)", pending.len());
        }

        let mut replayed = 0;
        let mut rolled_back = 0;
        for record in pending {
            let handle = match self.txn_log.adopt(record.clone()) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("Discarding transaction {}: {}", record.id, e);
                    self.txn_log
                        .discard(record, format!("superseded at restart: {}", e))
                        .await?;
                    rolled_back += 1;
                    continue;
                }
            };

            let op = handle.op().clone();
            match op.idempotency() {
                Idempotency::Redo => match self.redo(&op).await {
                    Ok(()) => {
                        info!("Redid {} for {}", op.name(), handle.target_id());
                        self.txn_log.commit(handle).await?;
                        replayed += 1;
                    }
                    Err(e) => {
                        warn!("Redo of {} for {} failed: {}", op.name(), handle.target_id(), e);
                        self.txn_log
                            .abort(handle, format!("redo at restart failed: {}", e))
                            .await?;
                        self.mark_entity_error(&op).await;
                        rolled_back += 1;
                    }
                },
                Idempotency::RollBack => {
                    info!("Rolling back interrupted {} for {}", op.name(), handle.target_id());
                    self.txn_log
                        .abort(handle, "interrupted operation rolled back at restart")
                        .await?;
                    self.mark_entity_error(&op).await;
                    rolled_back += 1;
                }
            }
        }
        Ok((replayed, rolled_back))
    }

    /// Re-execute an interrupted operation. Drivers treat repeats as no-ops.
    async fn redo(&self, op: &TxnOp) -> Result<()> {
        match op {
            TxnOp::AddVolume { volume } => {
                let mut current = self
                    .volumes
                    .read()
                    .get(&volume.name)
                    .cloned()
                    .unwrap_or_else(|| volume.clone());
                match current.state {
                    VolumeState::Creating => {
                        let driver = self.driver_for(&current.backend_uuid)?;
                        driver.create(&current).await?;
                        current.transition(VolumeState::Online)?;
                        self.persist_volume(&current).await?;
                    }
                    // Created before the commit was lost
                    VolumeState::Online => {}
                    // Moved on since; the array is not touched again
                    state => {
                        return Err(Error::VolumeNotOnline {
                            name: current.name.clone(),
                            state: state.to_string(),
                        })
                    }
                }
                self.registry
                    .add_volume_ref(&current.backend_uuid, &current.name);
                Ok(())
            }
            TxnOp::DeleteVolume { volume } => {
                let current = self.volumes.read().get(&volume.name).cloned();
                let mut current = match current {
                    Some(current) => current,
                    None => return Ok(()),
                };
                if self.registry.contains(&current.backend_uuid) {
                    let driver = self.driver_for(&current.backend_uuid)?;
                    match driver.destroy(&current).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                if current.state == VolumeState::Creating {
                    current.transition(VolumeState::Error)?;
                }
                current.transition(VolumeState::Deleting)?;
                self.forget_volume(&mut current).await
            }
            TxnOp::ResizeVolume {
                volume,
                new_size_bytes,
            } => {
                let mut current = self
                    .volumes
                    .read()
                    .get(&volume.name)
                    .cloned()
                    .ok_or_else(|| Error::not_found("Volume", volume.name.clone()))?;
                let driver = self.driver_for(&current.backend_uuid)?;
                driver.resize(&current, *new_size_bytes).await?;
                current.size_bytes = current.size_bytes.max(*new_size_bytes);
                self.persist_volume(&current).await
            }
            TxnOp::AddBackend { backend } => {
                if self.registry.contains(&backend.uuid) {
                    return Ok(());
                }
                let driver =
                    self.factory
                        .create(&backend.name, &backend.driver_name, &backend.config)?;
                self.install_backend(backend.clone(), driver).await.map(|_| ())
            }
            TxnOp::DeleteBackend { backend } => {
                let in_use = self.registry.volume_count(&backend.uuid);
                if in_use > 0 {
                    return Err(Error::BackendInUse {
                        uuid: backend.uuid.to_string(),
                        volumes: in_use,
                    });
                }
                self.retire_backend(backend).await
            }
            TxnOp::AddSnapshot { volume, snapshot } => {
                let current = self
                    .volumes
                    .read()
                    .get(&volume.name)
                    .cloned()
                    .ok_or_else(|| Error::not_found("Volume", volume.name.clone()))?;
                let driver = self.driver_for(&current.backend_uuid)?;
                let size_bytes = driver.create_snapshot(&current, &snapshot.name).await?;
                let mut snapshot = snapshot.clone();
                snapshot.size_bytes = size_bytes;
                snapshot.state = SnapshotState::Online;
                self.persist_snapshot(&snapshot).await
            }
            TxnOp::DeleteSnapshot { volume, snapshot } => {
                let current = self.volumes.read().get(&volume.name).cloned();
                if let Some(current) = current {
                    if let Ok(driver) = self.driver_for(&current.backend_uuid) {
                        match driver.delete_snapshot(&current, &snapshot.name).await {
                            Ok(()) => {}
                            Err(e) if e.is_not_found() => {}
                            Err(e) => return Err(e),
                        }
                    }
                }
                self.remove_snapshot_record(&snapshot.volume_name, &snapshot.name)
                    .await
            }
            TxnOp::CloneVolume { .. } | TxnOp::ImportVolume { .. } => Err(Error::Internal(
                format!("{} cannot be redone", op.name()),
            )),
        }
    }

    /// Move the entity an unresolvable operation targeted to its error state
    async fn mark_entity_error(&self, op: &TxnOp) {
        match op {
            TxnOp::AddVolume { volume }
            | TxnOp::ResizeVolume { volume, .. }
            | TxnOp::CloneVolume { volume, .. }
            | TxnOp::ImportVolume { volume, .. } => {
                let known = self.volumes.read().get(&volume.name).cloned();
                let mut current = known.unwrap_or_else(|| volume.clone());
                if self.registry.contains(&current.backend_uuid) {
                    self.registry
                        .add_volume_ref(&current.backend_uuid, &current.name);
                }
                self.fail_volume(&mut current).await;
            }
            TxnOp::DeleteVolume { volume } => {
                let known = self.volumes.read().get(&volume.name).cloned();
                if let Some(mut current) = known {
                    self.fail_volume(&mut current).await;
                }
            }
            TxnOp::AddSnapshot { snapshot, .. } | TxnOp::DeleteSnapshot { snapshot, .. } => {
                let known = self
                    .snapshots
                    .read()
                    .get(&(snapshot.volume_name.clone(), snapshot.name.clone()))
                    .cloned();
                let mut current = known.unwrap_or_else(|| snapshot.clone());
                self.fail_snapshot(&mut current).await;
            }
            TxnOp::AddBackend { backend } => {
                if !self.registry.contains(&backend.uuid) {
                    return;
                }
                match self
                    .registry
                    .update_state(&backend.uuid, BackendState::FailedToInitialize)
                {
                    Ok(updated) => {
                        if let Err(e) = self
                            .store
                            .put_record(&self.keys.backend(&backend.uuid), &updated)
                            .await
                        {
                            error!("Failed to persist state of backend {}: {}", backend.name, e);
                        }
                    }
                    Err(e) => warn!("Backend {} left as is: {}", backend.name, e),
                }
            }
            // A backend that could not be retired stays Deleting
            TxnOp::DeleteBackend { .. } => {}
        }
    }

    /// Entities left mid-operation with no transaction to finish them
    async fn reconcile_stranded(&self) {
        let stranded: Vec<Volume> = self
            .volumes
            .read()
            .values()
            .filter(|v| matches!(v.state, VolumeState::Creating | VolumeState::Deleting))
            .cloned()
            .collect();
        for mut volume in stranded {
            warn!("Volume {} stranded in {}", volume.name, volume.state);
            self.fail_volume(&mut volume).await;
        }

        let stranded: Vec<Snapshot> = self
            .snapshots
            .read()
            .values()
            .filter(|s| matches!(s.state, SnapshotState::Creating | SnapshotState::Deleting))
            .cloned()
            .collect();
        for mut snapshot in stranded {
            self.fail_snapshot(&mut snapshot).await;
        }
    }
}
