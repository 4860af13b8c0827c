//! Kubernetes CRD-backed store
//!
//! Each key is one namespaced `OrchestratorRecord` custom resource. Resource
//! names are derived from the SHA-256 of the key because store keys contain
//! characters Kubernetes names do not allow; the key itself lives in the resource body.

use crate::error::{Error, Result};
use crate::store::StoreClient;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

const FIELD_MANAGER: &str = "volume-orchestrator";
const ORCHESTRATOR_LABEL: &str = "orchestrator.billyronks.io/name";
const KIND_LABEL: &str = "orchestrator.billyronks.io/kind";

// =============================================================================
// OrchestratorRecord CRD
// =============================================================================

/// One persisted orchestrator key
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "orchestrator.billyronks.io",
    version = "v1",
    kind = "OrchestratorRecord",
    plural = "orchestratorrecords",
    shortname = "orec",
    printcolumn = r#"{"name": "Key", "type": "string", "jsonPath": ".spec.key"}"#,
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".spec.kind"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorRecordSpec {
    /// Full store key, e.g. `/vorch/volumes/vorch_pvc-1`
    pub key: String,
    /// Record kind, the collection segment of the key
    pub kind: String,
    /// JSON document
    pub value: String,
}

// =============================================================================
// Kube Store
// =============================================================================

pub struct KubeStore {
    api: Api<OrchestratorRecord>,
    orchestrator_name: String,
}

impl KubeStore {
    pub fn new(client: Client, namespace: &str, orchestrator_name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            orchestrator_name: orchestrator_name.to_string(),
        }
    }

    pub async fn try_default(namespace: &str, orchestrator_name: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace, orchestrator_name))
    }

    /// Kubernetes-safe resource name for a key
    pub fn resource_name(key: &str) -> String {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        format!("r-{}", &digest[..40])
    }

    /// Collection segment of a key: `/vorch/volumes/x` -> `volumes`
    pub fn record_kind(key: &str) -> String {
        collection(key).unwrap_or("root").to_string()
    }
}

fn collection(key: &str) -> Option<&str> {
    key.trim_start_matches('/')
        .split('/')
        .nth(1)
        .filter(|segment| !segment.is_empty())
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

#[async_trait]
impl StoreClient for KubeStore {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let name = Self::resource_name(key);
        let record = self
            .api
            .get_opt(&name)
            .await
            .map_err(|e| Error::store_unavailable("get", key, e))?;
        Ok(record.map(|r| r.spec.value))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let name = Self::resource_name(key);
        let kind = Self::record_kind(key);

        let mut record = OrchestratorRecord::new(
            &name,
            OrchestratorRecordSpec {
                key: key.to_string(),
                kind: kind.clone(),
                value: value.to_string(),
            },
        );
        record.metadata.labels = Some(
            [
                (ORCHESTRATOR_LABEL.to_string(), self.orchestrator_name.clone()),
                (KIND_LABEL.to_string(), kind),
            ]
            .into_iter()
            .collect(),
        );

        self.api
            .patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&record),
            )
            .await
            .map_err(|e| Error::store_unavailable("put", key, e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let name = Self::resource_name(key);
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::store_unavailable("delete", key, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut selector = format!("{}={}", ORCHESTRATOR_LABEL, self.orchestrator_name);
        if let Some(kind) = collection(prefix) {
            selector.push_str(&format!(",{}={}", KIND_LABEL, kind));
        }

        let records = self
            .api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| Error::store_unavailable("list", prefix, e))?;

        let mut entries: Vec<(String, String)> = records
            .items
            .into_iter()
            .filter(|r| r.spec.key.starts_with(prefix))
            .map(|r| (r.spec.key, r.spec.value))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        debug!("Listed {} records under {}", entries.len(), prefix);
        Ok(entries)
    }

    async fn health_check(&self) -> Result<bool> {
        match self.api.list(&ListParams::default().limit(1)).await {
            Ok(_) => Ok(true),
            Err(e) => {
                debug!("Store health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_resource_names_are_valid() {
        let name = KubeStore::resource_name("/vorch/publications/pvc-1/Node_A");
        assert!(name.len() <= 63);
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_eq!(name, KubeStore::resource_name("/vorch/publications/pvc-1/Node_A"));
    }

    #[test]
    fn test_record_kind() {
        assert_eq!(KubeStore::record_kind("/vorch/volumes/x"), "volumes");
        assert_eq!(KubeStore::record_kind("/vorch/publications/v/n"), "publications");
        assert_eq!(KubeStore::record_kind("/vorch/version"), "version");
    }

    #[test]
    fn test_crd_definition() {
        let crd = OrchestratorRecord::crd();
        assert_eq!(crd.spec.group, "orchestrator.billyronks.io");
        assert_eq!(crd.spec.names.kind, "OrchestratorRecord");
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
