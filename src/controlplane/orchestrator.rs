//! Volume Lifecycle Manager
//!
//! Owns every lifecycle mutation. Each mutating volume, backend and snapshot
//! operation follows the same shape:
//!
//! ```text
//!   validate ──► Begin (reserve target, persist intent)
//!                  │
//!                  ▼
//!            persist entity ──► driver call (deadline / cancellation)
//!                  │                    │
//!               success              failure / cancelled
//!                  │                    │
//!           persist outcome       entity -> Error
//!                  │                    │
//!               Commit               Abort
//! ```
//!
//! In-memory indexes are `parking_lot` locks, never held across an `.await`.

use crate::config::OrchestratorConfig;
use crate::controlplane::backends::BackendFactory;
use crate::domain::ports::{PublicationSource, PublishedVolume, StorageDriverRef};
use crate::domain::{
    config_fingerprint, derive_internal_name, resolve_storage_prefix, validate_name, AccessMode,
    Backend,
    BackendSpec, BackendState, CloneRequest, ImportRequest, Node, Snapshot, SnapshotState,
    StorageClass, Volume, VolumePublication, VolumeRequest, VolumeState,
};
use crate::error::{Error, Result};
use crate::matcher::{match_candidates, MatchRequest};
use crate::metrics::Metrics;
use crate::registry::BackendRegistry;
use crate::store::{KeyLayout, StoreExt, StoreRef, TimeoutStore};
use crate::txn::{volume_target, Transaction, TransactionLog, TxnHandle, TxnOp};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(super) const LIFECYCLE_IDLE: u8 = 0;
pub(super) const LIFECYCLE_BOOTSTRAPPING: u8 = 1;
pub(super) const LIFECYCLE_READY: u8 = 2;
pub(super) const LIFECYCLE_FAILED: u8 = 3;

// =============================================================================
// Request Context
// =============================================================================

/// Caller deadline and cancellation for one request
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// No deadline, cancelled only through the returned token
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            deadline: None,
            cancel,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .deadline
                .map(|deadline| Instant::now() >= deadline)
                .unwrap_or(false)
    }

    /// Resolves once the caller gives up, with the reason
    async fn interrupted(&self) -> String {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => "cancelled by caller".to_string(),
                _ = tokio::time::sleep_until(deadline) => "deadline exceeded".to_string(),
            },
            None => {
                self.cancel.cancelled().await;
                "cancelled by caller".to_string()
            }
        }
    }
}

enum Driven<T> {
    Done(Result<T>),
    Interrupted(String),
}

/// Run a driver call unless the caller gives up first
async fn drive<T>(ctx: &RequestContext, work: impl Future<Output = Result<T>>) -> Driven<T> {
    tokio::select! {
        biased;
        reason = ctx.interrupted() => Driven::Interrupted(reason),
        result = work => Driven::Done(result),
    }
}

fn driver_error(backend_uuid: &Uuid, operation: &str, target: &str, e: Error) -> Error {
    match e {
        e @ Error::DriverError { .. } => e,
        other => Error::DriverError {
            backend_uuid: backend_uuid.to_string(),
            operation: operation.to_string(),
            target: target.to_string(),
            reason: other.to_string(),
        },
    }
}

fn cancelled(operation: &str, target: &str, reason: impl Into<String>) -> Error {
    Error::Cancelled {
        operation: operation.to_string(),
        target: target.to_string(),
        reason: reason.into(),
    }
}

fn already_exists(kind: &str, name: &str) -> Error {
    Error::AlreadyExists {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// The volume lifecycle manager
pub struct Orchestrator {
    pub(super) config: Arc<OrchestratorConfig>,
    pub(super) keys: KeyLayout,
    pub(super) store: StoreRef,
    pub(super) txn_log: TransactionLog,
    pub(super) registry: Arc<BackendRegistry>,
    pub(super) factory: BackendFactory,
    /// Initialized drivers by backend UUID
    pub(super) drivers: RwLock<HashMap<Uuid, StorageDriverRef>>,
    /// Volumes by name
    pub(super) volumes: RwLock<BTreeMap<String, Volume>>,
    pub(super) storage_classes: RwLock<BTreeMap<String, StorageClass>>,
    pub(super) nodes: RwLock<BTreeMap<String, Node>>,
    /// Publications by (volume, node)
    pub(super) publications: RwLock<BTreeMap<(String, String), VolumePublication>>,
    /// Snapshots by (volume, snapshot)
    pub(super) snapshots: RwLock<BTreeMap<(String, String), Snapshot>>,
    pub(super) lifecycle: AtomicU8,
    pub(super) metrics: Arc<Metrics>,
}

impl Orchestrator {
    /// Create an orchestrator over `store`. Every store call is bounded by
    /// the configured store timeout. Nothing is served until `bootstrap`.
    pub fn new(
        config: Arc<OrchestratorConfig>,
        store: StoreRef,
        factory: BackendFactory,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let store: StoreRef = Arc::new(TimeoutStore::new(store, config.store_timeout()));
        let keys = KeyLayout::new(&config.orchestrator_name);

        Ok(Arc::new(Self {
            txn_log: TransactionLog::new(store.clone(), keys.clone()),
            keys,
            store,
            registry: BackendRegistry::new(),
            factory,
            drivers: RwLock::new(HashMap::new()),
            volumes: RwLock::new(BTreeMap::new()),
            storage_classes: RwLock::new(BTreeMap::new()),
            nodes: RwLock::new(BTreeMap::new()),
            publications: RwLock::new(BTreeMap::new()),
            snapshots: RwLock::new(BTreeMap::new()),
            lifecycle: AtomicU8::new(LIFECYCLE_IDLE),
            metrics: Arc::new(Metrics::new()?),
            config,
        }))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_READY
    }

    /// Number of targets with an unresolved transaction
    pub fn pending_transactions(&self) -> usize {
        self.txn_log.pending_count()
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }

    fn observe<T>(&self, operation: &str, result: Result<T>) -> Result<T> {
        self.metrics.record_operation(operation, &result);
        self.refresh_gauges();
        if let Err(e) = &result {
            debug!("{} failed: {}", operation, e);
        }
        result
    }

    pub(super) fn refresh_gauges(&self) {
        self.metrics
            .pending_transactions
            .set(self.txn_log.pending_count() as i64);
        self.metrics.backends.set(self.registry.len() as i64);
        self.metrics.volumes.set(self.volumes.read().len() as i64);
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn lookup_volume(&self, name: &str) -> Option<Volume> {
        self.volumes.read().get(name).cloned()
    }

    fn require_volume(&self, name: &str) -> Result<Volume> {
        self.lookup_volume(name)
            .ok_or_else(|| Error::not_found("Volume", name))
    }

    pub(super) fn driver_for(&self, backend_uuid: &Uuid) -> Result<StorageDriverRef> {
        if let Some(driver) = self.drivers.read().get(backend_uuid) {
            return Ok(driver.clone());
        }
        match self.registry.lookup(backend_uuid) {
            Some(backend) => Err(Error::BackendNotOnline {
                uuid: backend_uuid.to_string(),
                state: backend.state.to_string(),
            }),
            None => Err(Error::UnknownBackend {
                uuid: backend_uuid.to_string(),
            }),
        }
    }

    pub(super) fn internal_name(&self, backend: &Backend, name: &str) -> String {
        let prefix =
            resolve_storage_prefix(backend.storage_prefix(), &self.config.orchestrator_name);
        derive_internal_name(&prefix, name)
    }

    /// Write the volume record and refresh the index
    pub(super) async fn persist_volume(&self, volume: &Volume) -> Result<()> {
        self.store
            .put_record(&self.keys.volume(&volume.internal_name), volume)
            .await?;
        self.volumes
            .write()
            .insert(volume.name.clone(), volume.clone());
        Ok(())
    }

    /// Reference the volume's backend, then record the volume. The
    /// reference comes first so a concurrent backend delete either sees it
    /// or has already fenced the backend off.
    async fn admit_volume(&self, volume: &Volume) -> Result<()> {
        self.registry
            .claim_volume_ref(&volume.backend_uuid, &volume.name)?;
        if let Err(e) = self.persist_volume(volume).await {
            self.registry
                .remove_volume_ref(&volume.backend_uuid, &volume.name);
            return Err(e);
        }
        Ok(())
    }

    /// Move a volume to `Error`, logging rather than failing if that cannot
    /// be persisted
    pub(super) async fn fail_volume(&self, volume: &mut Volume) {
        if volume.state == VolumeState::Error || volume.transition(VolumeState::Error).is_err() {
            return;
        }
        warn!("Volume {} moved to Error", volume.name);
        if let Err(e) = self.persist_volume(volume).await {
            error!("Failed to persist Error state of volume {}: {}", volume.name, e);
        }
    }

    /// Drop every record of a volume whose array side is gone
    pub(super) async fn forget_volume(&self, volume: &mut Volume) -> Result<()> {
        let publications: Vec<String> = self
            .publications
            .read()
            .keys()
            .filter(|(v, _)| *v == volume.name)
            .map(|(_, node)| node.clone())
            .collect();
        for node in publications {
            self.store
                .delete(&self.keys.publication(&volume.name, &node))
                .await?;
            self.publications
                .write()
                .remove(&(volume.name.clone(), node));
        }

        let snapshots: Vec<String> = self
            .snapshots
            .read()
            .keys()
            .filter(|(v, _)| *v == volume.name)
            .map(|(_, snapshot)| snapshot.clone())
            .collect();
        for snapshot in snapshots {
            self.store
                .delete(&self.keys.snapshot(&volume.name, &snapshot))
                .await?;
            self.snapshots
                .write()
                .remove(&(volume.name.clone(), snapshot));
        }

        self.store
            .delete(&self.keys.volume(&volume.internal_name))
            .await?;
        if volume.state == VolumeState::Deleting {
            volume.transition(VolumeState::Deleted)?;
        }
        self.volumes.write().remove(&volume.name);
        self.registry
            .remove_volume_ref(&volume.backend_uuid, &volume.name);
        Ok(())
    }

    pub(super) async fn persist_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.store
            .put_record(
                &self.keys.snapshot(&snapshot.volume_name, &snapshot.name),
                snapshot,
            )
            .await?;
        self.snapshots.write().insert(
            (snapshot.volume_name.clone(), snapshot.name.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    pub(super) async fn fail_snapshot(&self, snapshot: &mut Snapshot) {
        snapshot.state = SnapshotState::Error;
        if let Err(e) = self.persist_snapshot(snapshot).await {
            error!(
                "Failed to persist Error state of snapshot {}/{}: {}",
                snapshot.volume_name, snapshot.name, e
            );
        }
    }

    pub(super) async fn remove_snapshot_record(&self, volume: &str, name: &str) -> Result<()> {
        self.store.delete(&self.keys.snapshot(volume, name)).await?;
        self.snapshots
            .write()
            .remove(&(volume.to_string(), name.to_string()));
        Ok(())
    }

    /// Commit on success, abort with the error as reason otherwise
    async fn finish<T>(&self, handle: TxnHandle, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.txn_log.commit(handle).await?;
                Ok(value)
            }
            Err(e) => {
                let id = handle.id();
                if let Err(abort_error) = self.txn_log.abort(handle, e.to_string()).await {
                    error!("Failed to roll back transaction {}: {}", id, abort_error);
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Backends
    // =========================================================================

    pub async fn add_backend(&self, spec: BackendSpec) -> Result<Backend> {
        let result = self.add_backend_inner(spec).await;
        self.observe("addBackend", result)
    }

    async fn add_backend_inner(&self, spec: BackendSpec) -> Result<Backend> {
        self.ensure_ready()?;
        validate_name("backend", &spec.name)?;
        if self.registry.lookup_by_name(&spec.name).is_some() {
            return Err(already_exists("Backend", &spec.name));
        }

        let driver = self
            .factory
            .create(&spec.name, &spec.driver_name, &spec.config)?;
        let uuid = Uuid::new_v4();
        let backend = Backend {
            uuid,
            name: spec.name,
            driver_name: spec.driver_name,
            config_fingerprint: config_fingerprint(&spec.config),
            state: BackendState::Online,
            multi_node: driver.multi_node(),
            config: spec.config,
            registration_order: self.registry.next_registration_order(),
            storage_pools: driver.storage_pools(uuid),
            created_at: Utc::now(),
        };

        let handle = self
            .txn_log
            .begin(TxnOp::AddBackend {
                backend: backend.clone(),
            })
            .await?;
        let outcome = self.install_backend(backend, driver).await;
        self.finish(handle, outcome).await
    }

    /// Initialize the driver, persist the backend and register it
    pub(super) async fn install_backend(
        &self,
        backend: Backend,
        driver: StorageDriverRef,
    ) -> Result<Backend> {
        driver
            .initialize()
            .await
            .map_err(|e| driver_error(&backend.uuid, "initialize", &backend.name, e))?;
        self.store
            .put_record(&self.keys.backend(&backend.uuid), &backend)
            .await?;

        if !self.registry.contains(&backend.uuid) {
            self.registry.register(backend.clone())?;
        }
        self.drivers.write().insert(backend.uuid, driver);
        info!(
            "Backend {} ({}) online with {} pool(s)",
            backend.name,
            backend.uuid,
            backend.storage_pools.len()
        );
        Ok(backend)
    }

    /// Remove a backend no volume references. Removing an absent backend
    /// succeeds.
    pub async fn delete_backend(&self, name: &str) -> Result<()> {
        let result = self.delete_backend_inner(name).await;
        self.observe("deleteBackend", result)
    }

    async fn delete_backend_inner(&self, name: &str) -> Result<()> {
        self.ensure_ready()?;
        let backend = match self.registry.lookup_by_name(name) {
            Some(backend) => backend,
            None => return Ok(()),
        };
        let in_use = self.registry.volume_count(&backend.uuid);
        if in_use > 0 {
            return Err(Error::BackendInUse {
                uuid: backend.uuid.to_string(),
                volumes: in_use,
            });
        }

        let handle = self
            .txn_log
            .begin(TxnOp::DeleteBackend {
                backend: backend.clone(),
            })
            .await?;
        let outcome = self.retire_backend(&backend).await;
        self.finish(handle, outcome).await
    }

    pub(super) async fn retire_backend(&self, backend: &Backend) -> Result<()> {
        if self.registry.contains(&backend.uuid) {
            let deleting = self.registry.begin_deletion(&backend.uuid)?;
            self.store
                .put_record(&self.keys.backend(&backend.uuid), &deleting)
                .await?;
            self.registry.remove(&backend.uuid)?;
        }
        self.store.delete(&self.keys.backend(&backend.uuid)).await?;
        self.drivers.write().remove(&backend.uuid);
        info!("Deleted backend {} ({})", backend.name, backend.uuid);
        Ok(())
    }

    /// Take a backend offline or bring it back. Bringing a backend that
    /// failed to initialize online re-initializes its driver first.
    pub async fn set_backend_state(&self, name: &str, state: BackendState) -> Result<Backend> {
        let result = self.set_backend_state_inner(name, state).await;
        self.observe("setBackendState", result)
    }

    async fn set_backend_state_inner(&self, name: &str, state: BackendState) -> Result<Backend> {
        self.ensure_ready()?;
        if !matches!(state, BackendState::Online | BackendState::Offline) {
            return Err(Error::Validation(format!(
                "backend state can only be set to online or offline, not {}",
                state
            )));
        }
        let backend = self
            .registry
            .lookup_by_name(name)
            .ok_or_else(|| Error::not_found("Backend", name))?;

        if state == BackendState::Online && backend.state == BackendState::FailedToInitialize {
            let driver =
                self.factory
                    .create(&backend.name, &backend.driver_name, &backend.config)?;
            driver
                .initialize()
                .await
                .map_err(|e| driver_error(&backend.uuid, "initialize", &backend.name, e))?;
            self.registry
                .update_pools(&backend.uuid, driver.storage_pools(backend.uuid))?;
            self.drivers.write().insert(backend.uuid, driver);
        }

        let updated = self.registry.update_state(&backend.uuid, state)?;
        self.store
            .put_record(&self.keys.backend(&backend.uuid), &updated)
            .await?;
        Ok(updated)
    }

    pub fn get_backend(&self, name: &str) -> Result<Backend> {
        self.ensure_ready()?;
        self.registry
            .lookup_by_name(name)
            .ok_or_else(|| Error::not_found("Backend", name))
    }

    /// Backends in registration order
    pub fn list_backends(&self) -> Result<Vec<Backend>> {
        self.ensure_ready()?;
        Ok(self.registry.snapshot())
    }

    // =========================================================================
    // Storage Classes
    // =========================================================================

    pub async fn add_storage_class(&self, class: StorageClass) -> Result<StorageClass> {
        self.ensure_ready()?;
        validate_name("storage class", &class.name)?;
        if self.storage_classes.read().contains_key(&class.name) {
            return Err(already_exists("StorageClass", &class.name));
        }
        self.save_storage_class(class).await
    }

    /// Replace a class's predicates. Existing volumes keep their placement.
    pub async fn update_storage_class(&self, class: StorageClass) -> Result<StorageClass> {
        self.ensure_ready()?;
        if !self.storage_classes.read().contains_key(&class.name) {
            return Err(Error::not_found("StorageClass", class.name));
        }
        self.save_storage_class(class).await
    }

    async fn save_storage_class(&self, class: StorageClass) -> Result<StorageClass> {
        self.store
            .put_record(&self.keys.storage_class(&class.name), &class)
            .await?;
        self.storage_classes
            .write()
            .insert(class.name.clone(), class.clone());
        info!("Saved storage class {}", class.name);
        Ok(class)
    }

    pub async fn delete_storage_class(&self, name: &str) -> Result<()> {
        self.ensure_ready()?;
        self.store.delete(&self.keys.storage_class(name)).await?;
        self.storage_classes.write().remove(name);
        Ok(())
    }

    pub fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.ensure_ready()?;
        self.storage_classes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("StorageClass", name))
    }

    pub fn list_storage_classes(&self) -> Result<Vec<StorageClass>> {
        self.ensure_ready()?;
        Ok(self.storage_classes.read().values().cloned().collect())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Register or refresh a node
    pub async fn add_node(&self, node: Node) -> Result<Node> {
        self.ensure_ready()?;
        validate_name("node", &node.name)?;
        self.store
            .put_record(&self.keys.node(&node.name), &node)
            .await?;
        self.nodes.write().insert(node.name.clone(), node.clone());
        debug!("Registered node {}", node.name);
        Ok(node)
    }

    /// Remove a node with no publications. Removing an absent node succeeds.
    pub async fn delete_node(&self, name: &str) -> Result<()> {
        self.ensure_ready()?;
        let published = self
            .publications
            .read()
            .keys()
            .filter(|(_, node)| node == name)
            .count();
        if published > 0 {
            return Err(Error::Validation(format!(
                "node {} still has {} publication(s)",
                name, published
            )));
        }
        self.store.delete(&self.keys.node(name)).await?;
        self.nodes.write().remove(name);
        Ok(())
    }

    pub fn get_node(&self, name: &str) -> Result<Node> {
        self.ensure_ready()?;
        self.nodes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("Node", name))
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.ensure_ready()?;
        Ok(self.nodes.read().values().cloned().collect())
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Place a new volume on the first eligible pool and create it there.
    /// A driver failure is not retried on another backend.
    pub async fn create_volume(&self, request: VolumeRequest, ctx: &RequestContext) -> Result<Volume> {
        let result = self.create_volume_inner(request, ctx).await;
        self.observe("createVolume", result)
    }

    async fn create_volume_inner(&self, request: VolumeRequest, ctx: &RequestContext) -> Result<Volume> {
        self.ensure_ready()?;
        request.validate()?;
        if self.lookup_volume(&request.name).is_some() {
            return Err(already_exists("Volume", &request.name));
        }

        let class = match &request.storage_class {
            Some(name) => Some(
                self.storage_classes
                    .read()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::not_found("StorageClass", name.clone()))?,
            ),
            None => None,
        };

        let match_request = MatchRequest::from_request(&request, class.as_ref());
        let candidate = match_candidates(&match_request, &self.registry.snapshot())
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoEligibleBackend {
                protocol: request.protocol.to_string(),
                access_mode: request.access_mode.to_string(),
            })?;

        let backend = self
            .registry
            .lookup(&candidate.backend_uuid)
            .ok_or_else(|| Error::UnknownBackend {
                uuid: candidate.backend_uuid.to_string(),
            })?;
        let protocol = backend
            .pool(&candidate.pool)
            .map(|pool| pool.protocol)
            .ok_or_else(|| Error::not_found("StoragePool", candidate.pool.clone()))?;
        let driver = self.driver_for(&backend.uuid)?;

        let volume = Volume {
            internal_name: self.internal_name(&backend, &request.name),
            name: request.name,
            backend_uuid: backend.uuid,
            pool: candidate.pool,
            size_bytes: request.size_bytes,
            protocol,
            access_mode: request.access_mode,
            volume_mode: request.volume_mode,
            state: VolumeState::Creating,
            luks: request.luks,
            storage_class: request.storage_class,
            clone_source: None,
            imported: false,
            created_at: Utc::now(),
        };

        if ctx.is_cancelled() {
            return Err(cancelled("createVolume", &volume.name, "cancelled before start"));
        }
        let handle = self
            .txn_log
            .begin(TxnOp::AddVolume {
                volume: volume.clone(),
            })
            .await?;
        let outcome = self.run_create(volume, driver, ctx).await;
        self.finish(handle, outcome).await
    }

    async fn run_create(
        &self,
        mut volume: Volume,
        driver: StorageDriverRef,
        ctx: &RequestContext,
    ) -> Result<Volume> {
        if self.lookup_volume(&volume.name).is_some() {
            return Err(already_exists("Volume", &volume.name));
        }
        self.admit_volume(&volume).await?;
        info!(
            "Creating volume {} as {} on pool {}",
            volume.name, volume.internal_name, volume.pool
        );

        match drive(ctx, driver.create(&volume)).await {
            Driven::Done(Ok(())) => {
                volume.transition(VolumeState::Online)?;
                self.persist_volume(&volume).await?;
                info!("Volume {} online", volume.name);
                Ok(volume)
            }
            Driven::Done(Err(e)) => {
                let err = driver_error(&volume.backend_uuid, "create", &volume.name, e);
                self.fail_volume(&mut volume).await;
                Err(err)
            }
            Driven::Interrupted(reason) => {
                self.fail_volume(&mut volume).await;
                Err(cancelled("createVolume", &volume.name, reason))
            }
        }
    }

    /// Destroy a volume and every record of it. Deleting an absent volume
    /// succeeds.
    pub async fn delete_volume(&self, name: &str, ctx: &RequestContext) -> Result<()> {
        let result = self.delete_volume_inner(name, ctx).await;
        self.observe("deleteVolume", result)
    }

    async fn delete_volume_inner(&self, name: &str, ctx: &RequestContext) -> Result<()> {
        self.ensure_ready()?;
        let volume = match self.lookup_volume(name) {
            Some(volume) => volume,
            None => {
                debug!("Volume {} already absent", name);
                return Ok(());
            }
        };
        if ctx.is_cancelled() {
            return Err(cancelled("deleteVolume", name, "cancelled before start"));
        }

        let handle = self
            .txn_log
            .begin(TxnOp::DeleteVolume { volume })
            .await?;
        let outcome = self.run_delete(name, ctx).await;
        self.finish(handle, outcome).await
    }

    async fn run_delete(&self, name: &str, ctx: &RequestContext) -> Result<()> {
        let mut volume = match self.lookup_volume(name) {
            Some(volume) => volume,
            None => return Ok(()),
        };

        // Creating cannot move straight to Deleting
        if volume.state == VolumeState::Creating {
            volume.transition(VolumeState::Error)?;
        }
        volume.transition(VolumeState::Deleting)?;
        self.persist_volume(&volume).await?;
        info!("Deleting volume {}", volume.name);

        if self.registry.contains(&volume.backend_uuid) {
            let driver = self.driver_for(&volume.backend_uuid)?;
            match drive(ctx, driver.destroy(&volume)).await {
                Driven::Done(Ok(())) => {}
                Driven::Done(Err(e)) if e.is_not_found() => {
                    debug!("Volume {} already gone from the array", volume.name);
                }
                Driven::Done(Err(e)) => {
                    let err = driver_error(&volume.backend_uuid, "destroy", &volume.name, e);
                    self.fail_volume(&mut volume).await;
                    return Err(err);
                }
                Driven::Interrupted(reason) => {
                    self.fail_volume(&mut volume).await;
                    return Err(cancelled("deleteVolume", &volume.name, reason));
                }
            }
        } else {
            warn!(
                "Backend {} of volume {} is gone; removing records only",
                volume.backend_uuid, volume.name
            );
        }

        self.forget_volume(&mut volume).await?;
        info!("Volume {} deleted", volume.name);
        Ok(())
    }

    /// Grow an online volume. A driver failure leaves it online at its old
    /// size.
    pub async fn resize_volume(
        &self,
        name: &str,
        new_size_bytes: u64,
        ctx: &RequestContext,
    ) -> Result<Volume> {
        let result = self.resize_volume_inner(name, new_size_bytes, ctx).await;
        self.observe("resizeVolume", result)
    }

    async fn resize_volume_inner(
        &self,
        name: &str,
        new_size_bytes: u64,
        ctx: &RequestContext,
    ) -> Result<Volume> {
        self.ensure_ready()?;
        let volume = self.require_volume(name)?;
        volume.ensure_online()?;
        if new_size_bytes == volume.size_bytes {
            return Ok(volume);
        }
        if new_size_bytes < volume.size_bytes {
            return Err(Error::Validation(format!(
                "volume {} cannot shrink from {} to {} bytes",
                name, volume.size_bytes, new_size_bytes
            )));
        }
        let driver = self.driver_for(&volume.backend_uuid)?;
        if ctx.is_cancelled() {
            return Err(cancelled("resizeVolume", name, "cancelled before start"));
        }

        let handle = self
            .txn_log
            .begin(TxnOp::ResizeVolume {
                volume,
                new_size_bytes,
            })
            .await?;
        let outcome = self.run_resize(name, new_size_bytes, driver, ctx).await;
        self.finish(handle, outcome).await
    }

    async fn run_resize(
        &self,
        name: &str,
        new_size_bytes: u64,
        driver: StorageDriverRef,
        ctx: &RequestContext,
    ) -> Result<Volume> {
        let mut volume = self.require_volume(name)?;
        volume.ensure_online()?;

        match drive(ctx, driver.resize(&volume, new_size_bytes)).await {
            Driven::Done(Ok(())) => {
                info!(
                    "Resized volume {} from {} to {} bytes",
                    volume.name, volume.size_bytes, new_size_bytes
                );
                volume.size_bytes = new_size_bytes;
                self.persist_volume(&volume).await?;
                Ok(volume)
            }
            Driven::Done(Err(e)) => Err(driver_error(&volume.backend_uuid, "resize", &volume.name, e)),
            Driven::Interrupted(reason) => {
                self.fail_volume(&mut volume).await;
                Err(cancelled("resizeVolume", &volume.name, reason))
            }
        }
    }

    /// Clone an online volume, or one of its snapshots, onto the same pool
    pub async fn clone_volume(&self, request: CloneRequest, ctx: &RequestContext) -> Result<Volume> {
        let result = self.clone_volume_inner(request, ctx).await;
        self.observe("cloneVolume", result)
    }

    async fn clone_volume_inner(&self, request: CloneRequest, ctx: &RequestContext) -> Result<Volume> {
        self.ensure_ready()?;
        validate_name("volume", &request.name)?;
        let source = self.require_volume(&request.source)?;
        source.ensure_online()?;
        if self.lookup_volume(&request.name).is_some() {
            return Err(already_exists("Volume", &request.name));
        }

        let size_bytes = match &request.snapshot {
            Some(snapshot) => {
                let found = self
                    .snapshots
                    .read()
                    .get(&(source.name.clone(), snapshot.clone()))
                    .cloned()
                    .ok_or_else(|| {
                        Error::not_found("Snapshot", format!("{}/{}", source.name, snapshot))
                    })?;
                if found.state != SnapshotState::Online {
                    return Err(Error::Validation(format!(
                        "snapshot {}/{} is not online",
                        source.name, snapshot
                    )));
                }
                found.size_bytes.max(1)
            }
            None => source.size_bytes,
        };

        let backend = self
            .registry
            .lookup(&source.backend_uuid)
            .ok_or_else(|| Error::UnknownBackend {
                uuid: source.backend_uuid.to_string(),
            })?;
        if backend.state != BackendState::Online {
            return Err(Error::BackendNotOnline {
                uuid: backend.uuid.to_string(),
                state: backend.state.to_string(),
            });
        }
        let driver = self.driver_for(&backend.uuid)?;

        let volume = Volume {
            internal_name: self.internal_name(&backend, &request.name),
            name: request.name,
            backend_uuid: backend.uuid,
            pool: source.pool.clone(),
            size_bytes,
            protocol: source.protocol,
            access_mode: source.access_mode,
            volume_mode: source.volume_mode,
            state: VolumeState::Creating,
            luks: source.luks.clone(),
            storage_class: source.storage_class.clone(),
            clone_source: Some(source.name.clone()),
            imported: false,
            created_at: Utc::now(),
        };

        if ctx.is_cancelled() {
            return Err(cancelled("cloneVolume", &volume.name, "cancelled before start"));
        }
        let handle = self
            .txn_log
            .begin(TxnOp::CloneVolume {
                source: source.clone(),
                volume: volume.clone(),
                snapshot: request.snapshot.clone(),
            })
            .await?;
        let outcome = self
            .run_clone(source, volume, request.snapshot, driver, ctx)
            .await;
        self.finish(handle, outcome).await
    }

    async fn run_clone(
        &self,
        source: Volume,
        mut volume: Volume,
        snapshot: Option<String>,
        driver: StorageDriverRef,
        ctx: &RequestContext,
    ) -> Result<Volume> {
        if self.lookup_volume(&volume.name).is_some() {
            return Err(already_exists("Volume", &volume.name));
        }
        self.admit_volume(&volume).await?;
        info!("Cloning volume {} from {}", volume.name, source.name);

        match drive(ctx, driver.create_clone(&source, &volume, snapshot.as_deref())).await {
            Driven::Done(Ok(())) => {
                volume.transition(VolumeState::Online)?;
                self.persist_volume(&volume).await?;
                Ok(volume)
            }
            Driven::Done(Err(e)) => {
                let err = driver_error(&volume.backend_uuid, "clone", &volume.name, e);
                self.fail_volume(&mut volume).await;
                Err(err)
            }
            Driven::Interrupted(reason) => {
                self.fail_volume(&mut volume).await;
                Err(cancelled("cloneVolume", &volume.name, reason))
            }
        }
    }

    /// Bring an existing array volume under management
    pub async fn import_volume(&self, request: ImportRequest, ctx: &RequestContext) -> Result<Volume> {
        let result = self.import_volume_inner(request, ctx).await;
        self.observe("importVolume", result)
    }

    async fn import_volume_inner(&self, request: ImportRequest, ctx: &RequestContext) -> Result<Volume> {
        self.ensure_ready()?;
        validate_name("volume", &request.name)?;
        if let Some(existing) = self.lookup_volume(&request.name) {
            existing.ensure_online()?;
            return Err(already_exists("Volume", &request.name));
        }

        let backend = self
            .registry
            .lookup(&request.backend_uuid)
            .ok_or_else(|| Error::UnknownBackend {
                uuid: request.backend_uuid.to_string(),
            })?;
        if backend.state != BackendState::Online {
            return Err(Error::BackendNotOnline {
                uuid: backend.uuid.to_string(),
                state: backend.state.to_string(),
            });
        }
        let protocol = backend
            .pool(&request.pool)
            .map(|pool| pool.protocol)
            .ok_or_else(|| Error::not_found("StoragePool", request.pool.clone()))?;
        let driver = self.driver_for(&backend.uuid)?;

        let volume = Volume {
            internal_name: self.internal_name(&backend, &request.name),
            name: request.name,
            backend_uuid: backend.uuid,
            pool: request.pool,
            size_bytes: 0,
            protocol,
            access_mode: request.access_mode,
            volume_mode: request.volume_mode,
            state: VolumeState::Creating,
            luks: request.luks,
            storage_class: None,
            clone_source: None,
            imported: true,
            created_at: Utc::now(),
        };

        if ctx.is_cancelled() {
            return Err(cancelled("importVolume", &volume.name, "cancelled before start"));
        }
        let handle = self
            .txn_log
            .begin(TxnOp::ImportVolume {
                original_name: request.original_name.clone(),
                volume: volume.clone(),
            })
            .await?;
        let outcome = self
            .run_import(request.original_name, volume, driver, ctx)
            .await;
        self.finish(handle, outcome).await
    }

    async fn run_import(
        &self,
        original_name: String,
        mut volume: Volume,
        driver: StorageDriverRef,
        ctx: &RequestContext,
    ) -> Result<Volume> {
        if self.lookup_volume(&volume.name).is_some() {
            return Err(already_exists("Volume", &volume.name));
        }
        self.admit_volume(&volume).await?;
        info!("Importing array volume {} as {}", original_name, volume.name);

        match drive(ctx, driver.import(&original_name, &volume)).await {
            Driven::Done(Ok(size_bytes)) => {
                volume.size_bytes = size_bytes;
                volume.transition(VolumeState::Online)?;
                self.persist_volume(&volume).await?;
                Ok(volume)
            }
            Driven::Done(Err(e)) => {
                let err = driver_error(&volume.backend_uuid, "import", &volume.name, e);
                self.fail_volume(&mut volume).await;
                Err(err)
            }
            Driven::Interrupted(reason) => {
                self.fail_volume(&mut volume).await;
                Err(cancelled("importVolume", &volume.name, reason))
            }
        }
    }

    pub fn get_volume(&self, name: &str) -> Result<Volume> {
        self.ensure_ready()?;
        self.require_volume(name)
    }

    pub fn list_volumes(&self) -> Result<Vec<Volume>> {
        self.ensure_ready()?;
        Ok(self.volumes.read().values().cloned().collect())
    }

    // =========================================================================
    // Publications
    // =========================================================================

    /// Attach a volume to a node. Publishing to the same node twice returns
    /// the existing publication.
    pub async fn publish_volume(
        &self,
        volume_name: &str,
        node_name: &str,
        read_only: bool,
        ctx: &RequestContext,
    ) -> Result<VolumePublication> {
        let result = self
            .publish_volume_inner(volume_name, node_name, read_only, ctx)
            .await;
        self.observe("publishVolume", result)
    }

    async fn publish_volume_inner(
        &self,
        volume_name: &str,
        node_name: &str,
        read_only: bool,
        ctx: &RequestContext,
    ) -> Result<VolumePublication> {
        self.ensure_ready()?;
        let volume = self.require_volume(volume_name)?;
        volume.ensure_online()?;
        let node = self
            .nodes
            .read()
            .get(node_name)
            .cloned()
            .ok_or_else(|| Error::not_found("Node", node_name))?;

        {
            let publications = self.publications.read();
            if let Some(existing) =
                publications.get(&(volume_name.to_string(), node_name.to_string()))
            {
                return Ok(existing.clone());
            }
            if !volume.access_mode.is_multi_node() {
                if let Some(((_, other), _)) =
                    publications.iter().find(|((v, _), _)| v == volume_name)
                {
                    return Err(Error::Validation(format!(
                        "volume {} ({}) is already published to node {}",
                        volume_name, volume.access_mode, other
                    )));
                }
            }
        }

        let driver = self.driver_for(&volume.backend_uuid)?;
        let info = match drive(ctx, driver.publish(&volume, &node)).await {
            Driven::Done(Ok(info)) => info,
            Driven::Done(Err(e)) => {
                return Err(driver_error(&volume.backend_uuid, "publish", volume_name, e))
            }
            Driven::Interrupted(reason) => {
                return Err(cancelled("publishVolume", volume_name, reason))
            }
        };

        let publication = VolumePublication {
            volume_name: volume.name.clone(),
            node_name: node.name.clone(),
            read_only: read_only || volume.access_mode == AccessMode::ReadOnlyMany,
            access_mode: volume.access_mode,
            target_portal: info.target_portal,
            target_iqn: info.target_iqn,
            lun: info.lun,
        };
        self.store
            .put_record(
                &self.keys.publication(&publication.volume_name, &publication.node_name),
                &publication,
            )
            .await?;
        self.publications.write().insert(
            (publication.volume_name.clone(), publication.node_name.clone()),
            publication.clone(),
        );
        info!("Published volume {} to node {}", volume_name, node_name);
        Ok(publication)
    }

    /// Detach a volume from a node. Unpublishing an absent publication
    /// succeeds.
    pub async fn unpublish_volume(
        &self,
        volume_name: &str,
        node_name: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        let result = self
            .unpublish_volume_inner(volume_name, node_name, ctx)
            .await;
        self.observe("unpublishVolume", result)
    }

    async fn unpublish_volume_inner(
        &self,
        volume_name: &str,
        node_name: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        self.ensure_ready()?;
        let key = (volume_name.to_string(), node_name.to_string());
        if !self.publications.read().contains_key(&key) {
            return Ok(());
        }

        if let Some(volume) = self.lookup_volume(volume_name) {
            if let Ok(driver) = self.driver_for(&volume.backend_uuid) {
                let node = self.nodes.read().get(node_name).cloned().unwrap_or(Node {
                    name: node_name.to_string(),
                    iqn: None,
                    ips: vec![],
                });
                match drive(ctx, driver.unpublish(&volume, &node)).await {
                    Driven::Done(Ok(())) => {}
                    Driven::Done(Err(e)) if e.is_not_found() => {}
                    Driven::Done(Err(e)) => {
                        return Err(driver_error(&volume.backend_uuid, "unpublish", volume_name, e))
                    }
                    Driven::Interrupted(reason) => {
                        return Err(cancelled("unpublishVolume", volume_name, reason))
                    }
                }
            }
        }

        self.store
            .delete(&self.keys.publication(volume_name, node_name))
            .await?;
        self.publications.write().remove(&key);
        info!("Unpublished volume {} from node {}", volume_name, node_name);
        Ok(())
    }

    pub fn get_publication(&self, volume_name: &str, node_name: &str) -> Result<VolumePublication> {
        self.ensure_ready()?;
        self.publications
            .read()
            .get(&(volume_name.to_string(), node_name.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found("Publication", format!("{}/{}", volume_name, node_name)))
    }

    pub fn list_publications(&self, volume_name: Option<&str>) -> Result<Vec<VolumePublication>> {
        self.ensure_ready()?;
        Ok(self
            .publications
            .read()
            .values()
            .filter(|p| volume_name.map(|v| p.volume_name == v).unwrap_or(true))
            .cloned()
            .collect())
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Snapshot an online volume. Repeating the request for an online
    /// snapshot returns it.
    pub async fn create_snapshot(
        &self,
        volume_name: &str,
        snapshot_name: &str,
        ctx: &RequestContext,
    ) -> Result<Snapshot> {
        let result = self
            .create_snapshot_inner(volume_name, snapshot_name, ctx)
            .await;
        self.observe("createSnapshot", result)
    }

    async fn create_snapshot_inner(
        &self,
        volume_name: &str,
        snapshot_name: &str,
        ctx: &RequestContext,
    ) -> Result<Snapshot> {
        self.ensure_ready()?;
        validate_name("snapshot", snapshot_name)?;
        let volume = self.require_volume(volume_name)?;
        volume.ensure_online()?;

        let existing = self
            .snapshots
            .read()
            .get(&(volume_name.to_string(), snapshot_name.to_string()))
            .cloned();
        if let Some(existing) = existing {
            if existing.state == SnapshotState::Online {
                return Ok(existing);
            }
            return Err(already_exists(
                "Snapshot",
                &format!("{}/{}", volume_name, snapshot_name),
            ));
        }
        let driver = self.driver_for(&volume.backend_uuid)?;
        if ctx.is_cancelled() {
            return Err(cancelled("createSnapshot", snapshot_name, "cancelled before start"));
        }

        let snapshot = Snapshot {
            name: snapshot_name.to_string(),
            volume_name: volume_name.to_string(),
            size_bytes: 0,
            state: SnapshotState::Creating,
            created_at: Utc::now(),
        };
        let handle = self
            .txn_log
            .begin(TxnOp::AddSnapshot {
                volume: volume.clone(),
                snapshot: snapshot.clone(),
            })
            .await?;
        let outcome = self.run_create_snapshot(volume, snapshot, driver, ctx).await;
        self.finish(handle, outcome).await
    }

    async fn run_create_snapshot(
        &self,
        volume: Volume,
        mut snapshot: Snapshot,
        driver: StorageDriverRef,
        ctx: &RequestContext,
    ) -> Result<Snapshot> {
        self.persist_snapshot(&snapshot).await?;

        match drive(ctx, driver.create_snapshot(&volume, &snapshot.name)).await {
            Driven::Done(Ok(size_bytes)) => {
                snapshot.size_bytes = size_bytes;
                snapshot.state = SnapshotState::Online;
                self.persist_snapshot(&snapshot).await?;
                info!("Snapshot {}/{} online", volume.name, snapshot.name);
                Ok(snapshot)
            }
            Driven::Done(Err(e)) => {
                let err = driver_error(&volume.backend_uuid, "createSnapshot", &snapshot.name, e);
                self.fail_snapshot(&mut snapshot).await;
                Err(err)
            }
            Driven::Interrupted(reason) => {
                self.fail_snapshot(&mut snapshot).await;
                Err(cancelled("createSnapshot", &snapshot.name, reason))
            }
        }
    }

    /// Delete a snapshot. Deleting an absent snapshot succeeds.
    pub async fn delete_snapshot(
        &self,
        volume_name: &str,
        snapshot_name: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        let result = self
            .delete_snapshot_inner(volume_name, snapshot_name, ctx)
            .await;
        self.observe("deleteSnapshot", result)
    }

    async fn delete_snapshot_inner(
        &self,
        volume_name: &str,
        snapshot_name: &str,
        ctx: &RequestContext,
    ) -> Result<()> {
        self.ensure_ready()?;
        let existing = self
            .snapshots
            .read()
            .get(&(volume_name.to_string(), snapshot_name.to_string()))
            .cloned();
        let snapshot = match existing {
            Some(snapshot) => snapshot,
            None => return Ok(()),
        };
        let volume = match self.lookup_volume(volume_name) {
            Some(volume) => volume,
            None => return self.remove_snapshot_record(volume_name, snapshot_name).await,
        };
        if ctx.is_cancelled() {
            return Err(cancelled("deleteSnapshot", snapshot_name, "cancelled before start"));
        }

        let handle = self
            .txn_log
            .begin(TxnOp::DeleteSnapshot {
                volume: volume.clone(),
                snapshot: snapshot.clone(),
            })
            .await?;
        let outcome = self.run_delete_snapshot(volume, snapshot, ctx).await;
        self.finish(handle, outcome).await
    }

    async fn run_delete_snapshot(
        &self,
        volume: Volume,
        mut snapshot: Snapshot,
        ctx: &RequestContext,
    ) -> Result<()> {
        snapshot.state = SnapshotState::Deleting;
        self.persist_snapshot(&snapshot).await?;

        if let Ok(driver) = self.driver_for(&volume.backend_uuid) {
            match drive(ctx, driver.delete_snapshot(&volume, &snapshot.name)).await {
                Driven::Done(Ok(())) => {}
                Driven::Done(Err(e)) if e.is_not_found() => {}
                Driven::Done(Err(e)) => {
                    let err =
                        driver_error(&volume.backend_uuid, "deleteSnapshot", &snapshot.name, e);
                    self.fail_snapshot(&mut snapshot).await;
                    return Err(err);
                }
                Driven::Interrupted(reason) => {
                    self.fail_snapshot(&mut snapshot).await;
                    return Err(cancelled("deleteSnapshot", &snapshot.name, reason));
                }
            }
        }

        self.remove_snapshot_record(&volume.name, &snapshot.name)
            .await?;
        info!("Deleted snapshot {}/{}", volume.name, snapshot.name);
        Ok(())
    }

    pub fn get_snapshot(&self, volume_name: &str, snapshot_name: &str) -> Result<Snapshot> {
        self.ensure_ready()?;
        self.snapshots
            .read()
            .get(&(volume_name.to_string(), snapshot_name.to_string()))
            .cloned()
            .ok_or_else(|| {
                Error::not_found("Snapshot", format!("{}/{}", volume_name, snapshot_name))
            })
    }

    pub fn list_snapshots(&self, volume_name: Option<&str>) -> Result<Vec<Snapshot>> {
        self.ensure_ready()?;
        Ok(self
            .snapshots
            .read()
            .values()
            .filter(|s| volume_name.map(|v| s.volume_name == v).unwrap_or(true))
            .cloned()
            .collect())
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Persisted transaction records, oldest first
    pub async fn list_transactions(&self) -> Result<Vec<Transaction>> {
        self.ensure_ready()?;
        self.txn_log.list().await
    }
}

impl PublicationSource for Orchestrator {
    fn iscsi_publications(&self, node_name: Option<&str>) -> Vec<PublishedVolume> {
        let volumes = self.volumes.read();
        self.publications
            .read()
            .values()
            .filter(|p| p.is_iscsi())
            .filter(|p| node_name.map(|n| p.node_name == n).unwrap_or(true))
            .filter_map(|publication| {
                volumes
                    .get(&publication.volume_name)
                    .filter(|v| v.state == VolumeState::Online)
                    .map(|volume| PublishedVolume {
                        volume: volume.clone(),
                        publication: publication.clone(),
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{FakeDriver, FakeDriverConfig, FakeOp, FakePoolConfig};
    use crate::domain::{Protocol, VolumeMode};
    use crate::store::InMemoryStore;
    use crate::txn::TransactionStatus;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn fake(protocol: Protocol, multi_node: bool, modes: &[AccessMode]) -> Arc<FakeDriver> {
        Arc::new(FakeDriver::new(FakeDriverConfig {
            protocol,
            multi_node,
            pools: vec![FakePoolConfig {
                name: "pool-a".into(),
                access_modes: modes.iter().copied().collect::<BTreeSet<_>>(),
                ..Default::default()
            }],
            ..Default::default()
        }))
    }

    async fn ready_orchestrator(factory: BackendFactory) -> (Arc<Orchestrator>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(OrchestratorConfig::default()),
            store.clone(),
            factory,
        )
        .unwrap();
        orchestrator.bootstrap().await.unwrap();
        (orchestrator, store)
    }

    fn backend_spec(name: &str, config: serde_json::Value) -> BackendSpec {
        BackendSpec {
            name: name.into(),
            driver_name: "fake".into(),
            config,
        }
    }

    fn request(name: &str, protocol: Protocol, mode: AccessMode) -> VolumeRequest {
        VolumeRequest {
            name: name.into(),
            size_bytes: 1 << 30,
            protocol,
            access_mode: mode,
            volume_mode: VolumeMode::Filesystem,
            storage_class: None,
            attributes: BTreeMap::new(),
            luks: None,
        }
    }

    /// B1 serves file single-node only; B2 serves block and attaches to
    /// several nodes.
    async fn b1_b2() -> (Arc<Orchestrator>, Arc<FakeDriver>, Arc<FakeDriver>) {
        let b1 = fake(Protocol::File, false, &[AccessMode::ReadWriteOnce]);
        let b2 = fake(
            Protocol::Block,
            true,
            &[AccessMode::ReadWriteOnce, AccessMode::ReadWriteMany],
        );
        let factory = BackendFactory::new()
            .with_driver("b1", b1.clone())
            .with_driver("b2", b2.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        orchestrator
            .add_backend(backend_spec("b2", json!({})))
            .await
            .unwrap();
        (orchestrator, b1, b2)
    }

    #[tokio::test]
    async fn test_requests_before_bootstrap_are_not_ready() {
        let orchestrator = Orchestrator::new(
            Arc::new(OrchestratorConfig::default()),
            Arc::new(InMemoryStore::new()),
            BackendFactory::new(),
        )
        .unwrap();

        assert_matches!(orchestrator.list_volumes(), Err(Error::NotReady));
        assert_matches!(
            orchestrator
                .create_volume(
                    request("pvc-1", Protocol::Any, AccessMode::ReadWriteOnce),
                    &RequestContext::background()
                )
                .await,
            Err(Error::NotReady)
        );
    }

    #[tokio::test]
    async fn test_block_multi_node_lands_on_b2() {
        let (orchestrator, b1, b2) = b1_b2().await;
        let ctx = RequestContext::background();

        let volume = orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteMany), &ctx)
            .await
            .unwrap();

        assert_eq!(volume.state, VolumeState::Online);
        assert_eq!(
            volume.backend_uuid,
            orchestrator.get_backend("b2").unwrap().uuid
        );
        assert!(b2.has_volume(&volume.internal_name));
        assert!(!b1.has_volume(&volume.internal_name));
    }

    #[tokio::test]
    async fn test_file_multi_node_has_no_eligible_backend() {
        let (orchestrator, _, _) = b1_b2().await;

        let err = orchestrator
            .create_volume(
                request("pvc-1", Protocol::File, AccessMode::ReadWriteMany),
                &RequestContext::background(),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoEligibleBackend { .. });
        assert!(orchestrator.list_volumes().unwrap().is_empty());
        assert_eq!(orchestrator.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_internal_name_uses_storage_prefix_or_orchestrator_name() {
        let (orchestrator, _) = ready_orchestrator(BackendFactory::new()).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({"storagePrefix": "team-"})))
            .await
            .unwrap();
        let ctx = RequestContext::background();

        let volume = orchestrator
            .create_volume(request("pvc-1", Protocol::Any, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();
        assert_eq!(volume.internal_name, "team-pvc-1");

        let (orchestrator, _) = ready_orchestrator(BackendFactory::new()).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({"storagePrefix": {"bad": 1}})))
            .await
            .unwrap();
        let volume = orchestrator
            .create_volume(request("pvc-1", Protocol::Any, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();
        assert_eq!(volume.internal_name, "vorch_pvc-1");
    }

    #[tokio::test]
    async fn test_driver_failure_rolls_back_and_marks_error() {
        let driver = fake(Protocol::Block, false, &[]);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();

        driver.fail_next(FakeOp::Create, 1);
        let err = orchestrator
            .create_volume(
                request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce),
                &RequestContext::background(),
            )
            .await
            .unwrap_err();

        assert_matches!(err, Error::DriverError { ref operation, .. } if operation == "create");
        assert_eq!(
            orchestrator.get_volume("pvc-1").unwrap().state,
            VolumeState::Error
        );
        assert_eq!(orchestrator.pending_transactions(), 0);
        let records = orchestrator.list_transactions().await.unwrap();
        let create = records
            .iter()
            .find(|r| r.target_id == "volume/pvc-1")
            .unwrap();
        assert_eq!(create.status, TransactionStatus::RolledBack);
        assert!(create.reason.as_deref().unwrap_or("").contains("injected"));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_removes_records() {
        let (orchestrator, _, b2) = b1_b2().await;
        let ctx = RequestContext::background();
        orchestrator
            .add_node(Node {
                name: "worker-1".into(),
                iqn: None,
                ips: vec![],
            })
            .await
            .unwrap();
        let volume = orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();
        orchestrator
            .publish_volume("pvc-1", "worker-1", false, &ctx)
            .await
            .unwrap();

        orchestrator.delete_volume("pvc-1", &ctx).await.unwrap();
        orchestrator.delete_volume("pvc-1", &ctx).await.unwrap();

        assert!(!b2.has_volume(&volume.internal_name));
        assert_matches!(orchestrator.get_volume("pvc-1"), Err(Error::NotFound { .. }));
        assert!(orchestrator.list_publications(None).unwrap().is_empty());
        assert_eq!(orchestrator.registry().volume_count(&volume.backend_uuid), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_create_conflicts() {
        let driver = fake(Protocol::Block, false, &[]);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        driver.set_latency(Duration::from_millis(100));

        let creator = orchestrator.clone();
        let create = tokio::spawn(async move {
            creator
                .create_volume(
                    request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce),
                    &RequestContext::background(),
                )
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = orchestrator
            .delete_volume("pvc-1", &RequestContext::background())
            .await
            .unwrap_err();
        assert_matches!(err, Error::ConflictingTransaction { .. });
        assert_eq!(orchestrator.pending_transactions(), 1);

        let volume = create.await.unwrap().unwrap();
        assert_eq!(volume.state, VolumeState::Online);
        assert_eq!(orchestrator.pending_transactions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_and_marks_error() {
        let driver = fake(Protocol::Block, false, &[]);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        driver.set_latency(Duration::from_secs(5));

        let ctx = RequestContext::background();
        let token = ctx.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled { .. });
        assert_eq!(
            orchestrator.get_volume("pvc-1").unwrap().state,
            VolumeState::Error
        );
        assert_eq!(orchestrator.pending_transactions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_resize_and_marks_error() {
        let driver = fake(Protocol::Block, false, &[]);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        orchestrator
            .create_volume(
                request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce),
                &RequestContext::background(),
            )
            .await
            .unwrap();

        driver.set_latency(Duration::from_secs(5));
        let err = orchestrator
            .resize_volume("pvc-1", 2 << 30, &RequestContext::with_timeout(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled { ref reason, .. } if reason == "deadline exceeded");
        assert_eq!(
            orchestrator.get_volume("pvc-1").unwrap().state,
            VolumeState::Error
        );
    }

    #[tokio::test]
    async fn test_resize_failure_keeps_volume_online() {
        let driver = fake(Protocol::Block, false, &[]);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        let ctx = RequestContext::background();
        orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();

        driver.fail_next(FakeOp::Resize, 1);
        assert_matches!(
            orchestrator.resize_volume("pvc-1", 2 << 30, &ctx).await,
            Err(Error::DriverError { .. })
        );
        let volume = orchestrator.get_volume("pvc-1").unwrap();
        assert_eq!(volume.state, VolumeState::Online);
        assert_eq!(volume.size_bytes, 1 << 30);

        let resized = orchestrator
            .resize_volume("pvc-1", 2 << 30, &ctx)
            .await
            .unwrap();
        assert_eq!(resized.size_bytes, 2 << 30);
        assert_matches!(
            orchestrator.resize_volume("pvc-1", 1 << 20, &ctx).await,
            Err(Error::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_operations_on_non_online_volume_fail_fast() {
        let driver = fake(Protocol::Block, false, &[]);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        let ctx = RequestContext::background();
        driver.fail_next(FakeOp::Create, 1);
        let _ = orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await;

        assert_matches!(
            orchestrator.resize_volume("pvc-1", 2 << 30, &ctx).await,
            Err(Error::VolumeNotOnline { .. })
        );
        assert_matches!(
            orchestrator
                .clone_volume(
                    CloneRequest {
                        source: "pvc-1".into(),
                        name: "pvc-2".into(),
                        snapshot: None
                    },
                    &ctx
                )
                .await,
            Err(Error::VolumeNotOnline { .. })
        );
        // An errored volume can still be deleted
        orchestrator.delete_volume("pvc-1", &ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_from_snapshot() {
        let driver = fake(Protocol::Block, false, &[]);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        let ctx = RequestContext::background();
        orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();

        let snapshot = orchestrator
            .create_snapshot("pvc-1", "snap-1", &ctx)
            .await
            .unwrap();
        assert_eq!(snapshot.state, SnapshotState::Online);
        assert_eq!(snapshot.size_bytes, 1 << 30);

        let clone = orchestrator
            .clone_volume(
                CloneRequest {
                    source: "pvc-1".into(),
                    name: "pvc-2".into(),
                    snapshot: Some("snap-1".into()),
                },
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(clone.clone_source.as_deref(), Some("pvc-1"));
        assert!(driver.has_volume(&clone.internal_name));

        orchestrator
            .delete_snapshot("pvc-1", "snap-1", &ctx)
            .await
            .unwrap();
        orchestrator
            .delete_snapshot("pvc-1", "snap-1", &ctx)
            .await
            .unwrap();
        assert!(orchestrator.list_snapshots(Some("pvc-1")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_requires_online_backend() {
        let driver = fake(Protocol::Block, false, &[]);
        driver.add_unmanaged_volume("lun-7", 3 << 30);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        let backend = orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        let ctx = RequestContext::background();
        let import = ImportRequest {
            name: "pvc-imported".into(),
            backend_uuid: backend.uuid,
            pool: "pool-a".into(),
            original_name: "lun-7".into(),
            access_mode: AccessMode::ReadWriteOnce,
            volume_mode: VolumeMode::Filesystem,
            luks: None,
        };

        orchestrator
            .set_backend_state("b1", BackendState::Offline)
            .await
            .unwrap();
        assert_matches!(
            orchestrator.import_volume(import.clone(), &ctx).await,
            Err(Error::BackendNotOnline { .. })
        );

        orchestrator
            .set_backend_state("b1", BackendState::Online)
            .await
            .unwrap();
        let volume = orchestrator.import_volume(import, &ctx).await.unwrap();
        assert!(volume.imported);
        assert_eq!(volume.size_bytes, 3 << 30);
        assert_eq!(volume.state, VolumeState::Online);
    }

    #[tokio::test]
    async fn test_single_node_volume_publishes_to_one_node() {
        let (orchestrator, _, _) = b1_b2().await;
        let ctx = RequestContext::background();
        for name in ["worker-1", "worker-2"] {
            orchestrator
                .add_node(Node {
                    name: name.into(),
                    iqn: None,
                    ips: vec![],
                })
                .await
                .unwrap();
        }
        orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();

        let first = orchestrator
            .publish_volume("pvc-1", "worker-1", false, &ctx)
            .await
            .unwrap();
        assert!(first.is_iscsi());
        let again = orchestrator
            .publish_volume("pvc-1", "worker-1", false, &ctx)
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_matches!(
            orchestrator
                .publish_volume("pvc-1", "worker-2", false, &ctx)
                .await,
            Err(Error::Validation(_))
        );
        assert_matches!(
            orchestrator.delete_node("worker-1").await,
            Err(Error::Validation(_))
        );

        orchestrator
            .unpublish_volume("pvc-1", "worker-1", &ctx)
            .await
            .unwrap();
        orchestrator
            .unpublish_volume("pvc-1", "worker-1", &ctx)
            .await
            .unwrap();
        orchestrator.delete_node("worker-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_in_use_cannot_be_deleted() {
        let (orchestrator, _, _) = b1_b2().await;
        let ctx = RequestContext::background();
        orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();

        assert_matches!(
            orchestrator.delete_backend("b2").await,
            Err(Error::BackendInUse { volumes: 1, .. })
        );
        orchestrator.delete_volume("pvc-1", &ctx).await.unwrap();
        orchestrator.delete_backend("b2").await.unwrap();
        orchestrator.delete_backend("b2").await.unwrap();
        assert_eq!(orchestrator.list_backends().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_class_update_affects_future_matches_only() {
        let (orchestrator, _, _) = b1_b2().await;
        let ctx = RequestContext::background();
        orchestrator
            .add_storage_class(StorageClass {
                name: "fast".into(),
                attributes: BTreeMap::new(),
                allowed_topologies: vec![],
            })
            .await
            .unwrap();
        let mut req = request("pvc-1", Protocol::Any, AccessMode::ReadWriteOnce);
        req.storage_class = Some("fast".into());
        let volume = orchestrator.create_volume(req, &ctx).await.unwrap();

        orchestrator
            .update_storage_class(StorageClass {
                name: "fast".into(),
                attributes: [(
                    "media".to_string(),
                    crate::domain::Requirement::String("nvme".into()),
                )]
                .into_iter()
                .collect(),
                allowed_topologies: vec![],
            })
            .await
            .unwrap();

        assert_eq!(orchestrator.get_volume("pvc-1").unwrap(), volume);
        let mut req = request("pvc-2", Protocol::Any, AccessMode::ReadWriteOnce);
        req.storage_class = Some("fast".into());
        assert_matches!(
            orchestrator.create_volume(req, &ctx).await,
            Err(Error::NoEligibleBackend { .. })
        );
    }

    #[tokio::test]
    async fn test_iscsi_publications_follow_publish_state() {
        let (orchestrator, _, _) = b1_b2().await;
        let ctx = RequestContext::background();
        orchestrator
            .add_node(Node {
                name: "worker-1".into(),
                iqn: None,
                ips: vec![],
            })
            .await
            .unwrap();
        orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();
        orchestrator
            .publish_volume("pvc-1", "worker-1", false, &ctx)
            .await
            .unwrap();
        assert_eq!(orchestrator.iscsi_publications(Some("worker-1")).len(), 1);
        assert!(orchestrator.iscsi_publications(Some("worker-2")).is_empty());

        orchestrator
            .unpublish_volume("pvc-1", "worker-1", &ctx)
            .await
            .unwrap();
        assert!(orchestrator.iscsi_publications(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_delete_and_volume_create_do_not_interleave() {
        let factory = BackendFactory::new().with_driver(
            "b1",
            fake(Protocol::Block, false, &[AccessMode::ReadWriteOnce]),
        );
        let (orchestrator, store) = ready_orchestrator(factory).await;
        let backend = orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        store.set_latency(Duration::from_millis(100));

        let deleting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.delete_backend("b1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let created = orchestrator
            .create_volume(
                request("pvc-1", Protocol::Any, AccessMode::ReadWriteOnce),
                &RequestContext::background(),
            )
            .await;
        let deleted = deleting.await.unwrap();

        match (deleted, created) {
            (Ok(()), Err(e)) => {
                assert_matches!(
                    e,
                    Error::BackendNotOnline { .. } | Error::UnknownBackend { .. }
                );
                assert!(orchestrator.get_backend("b1").is_err());
                assert!(orchestrator.get_volume("pvc-1").is_err());
            }
            (Err(e), Ok(volume)) => {
                assert_matches!(e, Error::BackendInUse { .. });
                assert_eq!(volume.backend_uuid, backend.uuid);
                assert!(orchestrator.get_backend("b1").is_ok());
            }
            (deleted, created) => panic!(
                "exactly one of delete and create must win: {:?} / {:?}",
                deleted, created
            ),
        }
        let live = usize::from(orchestrator.get_volume("pvc-1").is_ok());
        assert_eq!(orchestrator.registry().volume_count(&backend.uuid), live);
        assert_eq!(orchestrator.pending_transactions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_delete_is_refused_while_clone_is_pending() {
        let driver = fake(Protocol::Block, false, &[]);
        let factory = BackendFactory::new().with_driver("b1", driver.clone());
        let (orchestrator, _) = ready_orchestrator(factory).await;
        orchestrator
            .add_backend(backend_spec("b1", json!({})))
            .await
            .unwrap();
        let ctx = RequestContext::background();
        orchestrator
            .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
            .await
            .unwrap();
        driver.set_latency(Duration::from_millis(100));

        let cloning = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .clone_volume(
                        CloneRequest {
                            source: "pvc-1".into(),
                            name: "pvc-2".into(),
                            snapshot: None,
                        },
                        &RequestContext::background(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_matches!(
            orchestrator.delete_volume("pvc-1", &ctx).await,
            Err(Error::ConflictingTransaction { pending_op, .. }) if pending_op == "CloneVolume"
        );
        assert_eq!(
            orchestrator.get_volume("pvc-1").unwrap().state,
            VolumeState::Online
        );

        let clone = cloning.await.unwrap().unwrap();
        assert_eq!(clone.clone_source.as_deref(), Some("pvc-1"));
        orchestrator.delete_volume("pvc-1", &ctx).await.unwrap();
        assert_eq!(orchestrator.pending_transactions(), 0);
    }
}
