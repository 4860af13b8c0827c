//! Benchmarks for backend matching and the create/delete path
//!
//! Target: matching against 100 backends well under 100µs

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;
use volume_orchestrator::domain::{config_fingerprint, Offer, Requirement, StoragePool, Topology};
use volume_orchestrator::matcher::{match_candidates, MatchRequest};
use volume_orchestrator::{
    AccessMode, Backend, BackendFactory, BackendSpec, BackendState, InMemoryStore, Orchestrator,
    OrchestratorConfig, Protocol, RequestContext, VolumeMode, VolumeRequest,
};

fn pool(index: usize, protocol: Protocol) -> StoragePool {
    let mut attributes = BTreeMap::new();
    attributes.insert("encryption".to_string(), Offer::Bool(index % 2 == 0));
    attributes.insert(
        "media".to_string(),
        Offer::Strings(["ssd".to_string(), "hdd".to_string()].into_iter().collect()),
    );
    StoragePool {
        name: format!("pool-{}", index),
        backend_uuid: Uuid::nil(),
        protocol,
        attributes,
        access_modes: BTreeSet::new(),
        topology: Topology::new(),
    }
}

fn backends(count: usize) -> Vec<Backend> {
    (0..count)
        .map(|i| Backend {
            uuid: Uuid::new_v4(),
            name: format!("backend-{}", i),
            driver_name: "fake".into(),
            config_fingerprint: config_fingerprint(&serde_json::Value::Null),
            state: BackendState::Online,
            multi_node: i % 3 == 0,
            config: serde_json::Value::Null,
            registration_order: i as u64,
            storage_pools: (0..4)
                .map(|p| pool(p, if i % 2 == 0 { Protocol::Block } else { Protocol::File }))
                .collect(),
            created_at: Utc::now(),
        })
        .collect()
}

fn bench_match_candidates(c: &mut Criterion) {
    let mut group = c.benchmark_group("matcher");

    let mut attributes = BTreeMap::new();
    attributes.insert("encryption".to_string(), Requirement::Bool(true));
    attributes.insert("media".to_string(), Requirement::String("ssd".into()));
    let request = MatchRequest {
        protocol: Protocol::Block,
        access_mode: AccessMode::ReadWriteMany,
        volume_mode: VolumeMode::Filesystem,
        attributes,
        allowed_topologies: vec![],
    };

    for count in [10usize, 100, 1000] {
        let fleet = backends(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("match", count), &fleet, |b, fleet| {
            b.iter(|| match_candidates(black_box(&request), black_box(fleet)));
        });
    }

    group.finish();
}

fn bench_create_delete(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let orchestrator = rt.block_on(async {
        let orchestrator = Orchestrator::new(
            Arc::new(OrchestratorConfig::default()),
            Arc::new(InMemoryStore::new()),
            BackendFactory::new(),
        )
        .unwrap();
        orchestrator.bootstrap().await.unwrap();
        orchestrator
            .add_backend(BackendSpec {
                name: "b1".into(),
                driver_name: "fake".into(),
                config: serde_json::json!({}),
            })
            .await
            .unwrap();
        orchestrator
    });

    group.bench_function("create_then_delete", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let name = format!("pvc-{}", counter);
            rt.block_on(async {
                let ctx = RequestContext::background();
                orchestrator
                    .create_volume(
                        VolumeRequest {
                            name: name.clone(),
                            size_bytes: 1 << 30,
                            protocol: Protocol::Any,
                            access_mode: AccessMode::ReadWriteOnce,
                            volume_mode: VolumeMode::Filesystem,
                            storage_class: None,
                            attributes: BTreeMap::new(),
                            luks: None,
                        },
                        &ctx,
                    )
                    .await
                    .unwrap();
                orchestrator.delete_volume(&name, &ctx).await.unwrap();
            });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_match_candidates, bench_create_delete);
criterion_main!(benches);
