//! Store key layout
//!
//! Every key lives under `/<orchestrator>`. Collection prefixes end in `/` so
//! a prefix listing for `pvc-1` never returns `pvc-10`.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn new(orchestrator_name: &str) -> Self {
        Self {
            root: format!("/{}", orchestrator_name),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn version(&self) -> String {
        format!("{}/version", self.root)
    }

    pub fn backends(&self) -> String {
        format!("{}/backends/", self.root)
    }

    pub fn backend(&self, uuid: &Uuid) -> String {
        format!("{}/backends/{}", self.root, uuid)
    }

    pub fn volumes(&self) -> String {
        format!("{}/volumes/", self.root)
    }

    /// Volumes are keyed by their array-side name
    pub fn volume(&self, internal_name: &str) -> String {
        format!("{}/volumes/{}", self.root, internal_name)
    }

    pub fn storage_classes(&self) -> String {
        format!("{}/storageclasses/", self.root)
    }

    pub fn storage_class(&self, name: &str) -> String {
        format!("{}/storageclasses/{}", self.root, name)
    }

    pub fn transactions(&self) -> String {
        format!("{}/transactions/", self.root)
    }

    pub fn transaction(&self, id: &Uuid) -> String {
        format!("{}/transactions/{}", self.root, id)
    }

    pub fn nodes(&self) -> String {
        format!("{}/nodes/", self.root)
    }

    pub fn node(&self, name: &str) -> String {
        format!("{}/nodes/{}", self.root, name)
    }

    pub fn publications(&self) -> String {
        format!("{}/publications/", self.root)
    }

    pub fn publications_of(&self, volume: &str) -> String {
        format!("{}/publications/{}/", self.root, volume)
    }

    pub fn publication(&self, volume: &str, node: &str) -> String {
        format!("{}/publications/{}/{}", self.root, volume, node)
    }

    pub fn snapshots(&self) -> String {
        format!("{}/snapshots/", self.root)
    }

    pub fn snapshots_of(&self, volume: &str) -> String {
        format!("{}/snapshots/{}/", self.root, volume)
    }

    pub fn snapshot(&self, volume: &str, name: &str) -> String {
        format!("{}/snapshots/{}/{}", self.root, volume, name)
    }
}
