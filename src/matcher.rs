//! Storage Class Matcher
//!
//! Pure function from a volume request to the ordered list of eligible
//! `(backend, pool)` candidates. No I/O and no state: given the same registry
//! snapshot it always returns the same answer, in backend registration order
//! and then pool name.

use crate::domain::{
    AccessMode, Backend, BackendState, Protocol, Requirement, StorageClass, StoragePool,
    Topology, VolumeMode, VolumeRequest,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// What the matcher needs to know about a request
#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub protocol: Protocol,
    pub access_mode: AccessMode,
    pub volume_mode: VolumeMode,
    pub attributes: BTreeMap<String, Requirement>,
    /// Empty means unrestricted
    pub allowed_topologies: Vec<Topology>,
}

impl MatchRequest {
    /// Combine a volume request with its storage class. Request attributes
    /// override class attributes of the same name.
    pub fn from_request(request: &VolumeRequest, class: Option<&StorageClass>) -> Self {
        let mut attributes = class.map(|c| c.attributes.clone()).unwrap_or_default();
        attributes.extend(request.attributes.clone());

        Self {
            protocol: request.protocol,
            access_mode: request.access_mode,
            volume_mode: request.volume_mode,
            attributes,
            allowed_topologies: class
                .map(|c| c.allowed_topologies.clone())
                .unwrap_or_default(),
        }
    }
}

/// An eligible placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub backend_uuid: Uuid,
    pub backend_name: String,
    pub pool: String,
}

/// Eligible candidates, ordered by backend registration order then pool name
pub fn match_candidates(request: &MatchRequest, backends: &[Backend]) -> Vec<Candidate> {
    let mut ordered: Vec<&Backend> = backends.iter().collect();
    ordered.sort_by_key(|b| b.registration_order);

    let mut candidates = Vec::new();
    for backend in ordered {
        if !backend_eligible(request, backend) {
            continue;
        }
        let mut pools: Vec<&StoragePool> = backend
            .storage_pools
            .iter()
            .filter(|pool| pool_eligible(request, pool))
            .collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));

        candidates.extend(pools.into_iter().map(|pool| Candidate {
            backend_uuid: backend.uuid,
            backend_name: backend.name.clone(),
            pool: pool.name.clone(),
        }));
    }
    candidates
}

fn backend_eligible(request: &MatchRequest, backend: &Backend) -> bool {
    if backend.state != BackendState::Online {
        return false;
    }
    if request.access_mode.is_multi_node() && !backend.multi_node {
        return false;
    }
    true
}

fn pool_eligible(request: &MatchRequest, pool: &StoragePool) -> bool {
    if !request.protocol.accepts(pool.protocol) {
        return false;
    }
    if request.volume_mode == VolumeMode::RawBlock && pool.protocol != Protocol::Block {
        return false;
    }
    if !pool.supports_access_mode(request.access_mode) {
        return false;
    }
    let attributes_ok = request.attributes.iter().all(|(name, requirement)| {
        pool.attributes
            .get(name)
            .map(|offer| offer.satisfies(requirement))
            .unwrap_or(false)
    });
    if !attributes_ok {
        return false;
    }
    topology_allowed(&request.allowed_topologies, &pool.topology)
}

/// A pool with no topology is reachable everywhere; otherwise every segment
/// of at least one allowed topology must match the pool's.
fn topology_allowed(allowed: &[Topology], pool: &Topology) -> bool {
    if allowed.is_empty() || pool.is_empty() {
        return true;
    }
    allowed.iter().any(|requirement| {
        requirement
            .iter()
            .all(|(key, value)| pool.get(key).map(|v| v == value).unwrap_or(false))
    })
}
