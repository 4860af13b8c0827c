//! End-to-end behaviour of the orchestrator against in-process stores and
//! the fake driver.

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use volume_orchestrator::controlplane::FakeDriver;
use volume_orchestrator::domain::ports::{IscsiClient, SessionTarget};
use volume_orchestrator::domain::SessionState;
use volume_orchestrator::healing::{MemoryLuksDeviceProvider, MemoryPassphraseSource};
use volume_orchestrator::store::{KeyLayout, PersistentStateVersion, StoreExt};
use volume_orchestrator::txn::{Transaction, TxnOp};
use volume_orchestrator::{
    AccessMode, BackendFactory, BackendSpec, Error, FileStore, HealingConfig, InMemoryStore, Node,
    Orchestrator, OrchestratorConfig, Protocol, RequestContext, SessionSelfHealer, StoreRef,
    VolumeMode, VolumeRequest, VolumeState,
};

fn config() -> Arc<OrchestratorConfig> {
    Arc::new(OrchestratorConfig::default())
}

fn request(name: &str, protocol: Protocol, access_mode: AccessMode) -> VolumeRequest {
    VolumeRequest {
        name: name.into(),
        size_bytes: 1 << 30,
        protocol,
        access_mode,
        volume_mode: VolumeMode::Filesystem,
        storage_class: None,
        attributes: BTreeMap::new(),
        luks: None,
    }
}

/// B1: file, single-node, RWO only. B2: block, multi-node, RWO and RWX.
async fn add_b1_b2(orchestrator: &Orchestrator) {
    orchestrator
        .add_backend(BackendSpec {
            name: "b1".into(),
            driver_name: "fake".into(),
            config: json!({
                "protocol": "file",
                "multiNode": false,
                "pools": [{"name": "nas", "accessModes": ["ReadWriteOnce"]}]
            }),
        })
        .await
        .unwrap();
    orchestrator
        .add_backend(BackendSpec {
            name: "b2".into(),
            driver_name: "fake".into(),
            config: json!({
                "protocol": "block",
                "multiNode": true,
                "pools": [{"name": "san", "accessModes": ["ReadWriteOnce", "ReadWriteMany"]}]
            }),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_matching_scenario_end_to_end() {
    let orchestrator =
        Orchestrator::new(config(), Arc::new(InMemoryStore::new()), BackendFactory::new()).unwrap();
    orchestrator.bootstrap().await.unwrap();
    add_b1_b2(&orchestrator).await;
    let ctx = RequestContext::background();
    let b2 = orchestrator.get_backend("b2").unwrap();

    let shared = orchestrator
        .create_volume(request("shared", Protocol::Block, AccessMode::ReadWriteMany), &ctx)
        .await
        .unwrap();
    assert_eq!(shared.backend_uuid, b2.uuid);
    assert_eq!(shared.pool, "san");

    let err = orchestrator
        .create_volume(request("nfs", Protocol::File, AccessMode::ReadWriteMany), &ctx)
        .await
        .unwrap_err();
    assert_matches!(err, Error::NoEligibleBackend { .. });

    // Any protocol, single node: first in registration order wins
    let first = orchestrator
        .create_volume(request("any", Protocol::Any, AccessMode::ReadWriteOnce), &ctx)
        .await
        .unwrap();
    assert_eq!(first.backend_uuid, orchestrator.get_backend("b1").unwrap().uuid);

    orchestrator.delete_volume("shared", &ctx).await.unwrap();
    orchestrator.delete_volume("shared", &ctx).await.unwrap();
    assert!(orchestrator.get_volume("shared").is_err());
    assert_eq!(orchestrator.pending_transactions(), 0);
}

#[tokio::test]
async fn test_multi_node_requests_need_a_multi_node_backend() {
    let orchestrator =
        Orchestrator::new(config(), Arc::new(InMemoryStore::new()), BackendFactory::new()).unwrap();
    orchestrator.bootstrap().await.unwrap();
    let ctx = RequestContext::background();
    let modes = json!(["ReadWriteOnce", "ReadWriteMany"]);
    orchestrator
        .add_backend(BackendSpec {
            name: "b1".into(),
            driver_name: "fake".into(),
            config: json!({
                "protocol": "block",
                "multiNode": false,
                "pools": [{"name": "san", "accessModes": modes.clone()}]
            }),
        })
        .await
        .unwrap();
    orchestrator
        .add_backend(BackendSpec {
            name: "b2".into(),
            driver_name: "fake".into(),
            config: json!({
                "protocol": "file",
                "multiNode": true,
                "pools": [{"name": "nas", "accessModes": modes}]
            }),
        })
        .await
        .unwrap();

    let shared = orchestrator
        .create_volume(request("shared-fs", Protocol::File, AccessMode::ReadWriteMany), &ctx)
        .await
        .unwrap();
    assert_eq!(shared.backend_uuid, orchestrator.get_backend("b2").unwrap().uuid);
    assert_eq!(shared.state, VolumeState::Online);

    let err = orchestrator
        .create_volume(request("shared-blk", Protocol::Block, AccessMode::ReadWriteMany), &ctx)
        .await
        .unwrap_err();
    assert_matches!(err, Error::NoEligibleBackend { .. });
    assert!(orchestrator.get_volume("shared-blk").is_err());
    assert_eq!(orchestrator.pending_transactions(), 0);
}

#[tokio::test]
async fn test_crash_after_begin_is_redone_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let driver = Arc::new(FakeDriver::from_config(&json!({})).unwrap());

    let backend = {
        let store = Arc::new(FileStore::with_path(dir.path()).await.unwrap());
        let first = Orchestrator::new(
            config(),
            store,
            BackendFactory::new().with_driver("b1", driver.clone()),
        )
        .unwrap();
        first.bootstrap().await.unwrap();
        first
            .add_backend(BackendSpec {
                name: "b1".into(),
                driver_name: "fake".into(),
                config: json!({}),
            })
            .await
            .unwrap()
    };

    // The process died right after durably recording intent
    let volume = volume_orchestrator::Volume {
        name: "pvc-crash".into(),
        internal_name: "vorch_pvc-crash".into(),
        backend_uuid: backend.uuid,
        pool: "pool-0".into(),
        size_bytes: 1 << 30,
        protocol: Protocol::Block,
        access_mode: AccessMode::ReadWriteOnce,
        volume_mode: VolumeMode::Filesystem,
        state: VolumeState::Creating,
        luks: None,
        storage_class: None,
        clone_source: None,
        imported: false,
        created_at: chrono::Utc::now(),
    };
    let record = Transaction::pending(TxnOp::AddVolume { volume });
    let store: StoreRef = Arc::new(FileStore::with_path(dir.path()).await.unwrap());
    let keys = KeyLayout::new("vorch");
    store
        .put_record(&keys.transaction(&record.id), &record)
        .await
        .unwrap();

    let second = Orchestrator::new(
        config(),
        store.clone(),
        BackendFactory::new().with_driver("b1", driver.clone()),
    )
    .unwrap();
    let report = second.bootstrap().await.unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(
        second.get_volume("pvc-crash").unwrap().state,
        VolumeState::Online
    );
    assert!(driver.has_volume("vorch_pvc-crash"));
    assert_eq!(second.pending_transactions(), 0);
    let remaining: Option<Transaction> = store
        .get_record(&keys.transaction(&record.id))
        .await
        .unwrap();
    assert!(remaining.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_store_is_fatal_after_thirty_attempts() {
    let store = Arc::new(InMemoryStore::new());
    store.set_available(false);
    let orchestrator = Orchestrator::new(config(), store, BackendFactory::new()).unwrap();

    let started = Instant::now();
    let err = orchestrator.bootstrap().await.unwrap_err();
    assert_matches!(err, Error::BootstrapFailed { attempts: 30, .. });
    assert!(started.elapsed() <= Duration::from_secs(30));

    let err = orchestrator
        .create_volume(
            request("pvc-1", Protocol::Any, AccessMode::ReadWriteOnce),
            &RequestContext::background(),
        )
        .await
        .unwrap_err();
    assert_matches!(err, Error::NotReady);
}

#[tokio::test]
async fn test_newer_store_schema_is_refused_untouched() {
    let store = Arc::new(InMemoryStore::new());
    let newer = PersistentStateVersion {
        store_schema_version: 3,
        orchestrator_api_version: 1,
        publications_synced: true,
    };
    store.put_record("/vorch/version", &newer).await.unwrap();
    let writes = store.write_count();

    let orchestrator = Orchestrator::new(config(), store.clone(), BackendFactory::new()).unwrap();
    let err = orchestrator.bootstrap().await.unwrap_err();

    assert_matches!(err, Error::UnsupportedStoreVersion { found: 3, supported: 2 });
    assert_eq!(store.write_count(), writes);
    let stored: Option<PersistentStateVersion> = store.get_record("/vorch/version").await.unwrap();
    assert_eq!(stored, Some(newer));
    assert!(!orchestrator.is_ready());
}

#[derive(Default)]
struct RecordingIscsi {
    logins: Mutex<Vec<String>>,
}

#[async_trait]
impl IscsiClient for RecordingIscsi {
    async fn inspect(&self, target: &SessionTarget) -> volume_orchestrator::Result<SessionState> {
        if self.logins.lock().contains(&target.iqn) {
            Ok(SessionState::Healthy)
        } else {
            Ok(SessionState::Missing)
        }
    }

    async fn login(&self, target: &SessionTarget) -> volume_orchestrator::Result<()> {
        self.logins.lock().push(target.iqn.clone());
        Ok(())
    }

    async fn logout(&self, _target: &SessionTarget) -> volume_orchestrator::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_self_healing_repairs_published_volume_sessions() {
    let orchestrator =
        Orchestrator::new(config(), Arc::new(InMemoryStore::new()), BackendFactory::new()).unwrap();
    orchestrator.bootstrap().await.unwrap();
    add_b1_b2(&orchestrator).await;
    let ctx = RequestContext::background();

    orchestrator
        .add_node(Node {
            name: "worker-1".into(),
            iqn: Some("iqn.2024-01.io.example:worker-1".into()),
            ips: vec!["10.0.0.21".into()],
        })
        .await
        .unwrap();
    orchestrator
        .create_volume(request("pvc-1", Protocol::Block, AccessMode::ReadWriteOnce), &ctx)
        .await
        .unwrap();
    let publication = orchestrator
        .publish_volume("pvc-1", "worker-1", false, &ctx)
        .await
        .unwrap();
    assert!(publication.is_iscsi());

    let iscsi = Arc::new(RecordingIscsi::default());
    let healer = SessionSelfHealer::new(
        HealingConfig {
            wait_window_secs: 0,
            ..Default::default()
        },
        orchestrator.clone(),
        iscsi.clone(),
        Arc::new(MemoryLuksDeviceProvider::new()),
        Arc::new(MemoryPassphraseSource::new()),
        orchestrator.metrics().clone(),
    );

    let report = healer.tick_at(Instant::now()).await;
    assert_eq!(report.sessions, 1);
    assert_eq!(report.repaired, 1);
    assert_eq!(iscsi.logins.lock().clone(), vec![publication.target_iqn.unwrap()]);

    let report = healer.tick_at(Instant::now()).await;
    assert_eq!(report.healthy, 1);
    assert_eq!(report.repaired, 0);
}
