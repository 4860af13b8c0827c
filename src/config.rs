//! Orchestrator Configuration
//!
//! One `OrchestratorConfig` is built at startup from defaults, an optional
//! YAML file and CLI/env overrides, then shared as `Arc` with every component.

use crate::domain::version::{KUBERNETES_VERSION_MAX, KUBERNETES_VERSION_MIN};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Orchestrator name used when nothing else is configured. Also the store key
/// root and the fallback storage prefix.
pub const DEFAULT_ORCHESTRATOR_NAME: &str = "vorch";

/// REST API version served under `/<name>/v<version>`
pub const DEFAULT_API_VERSION: u32 = 1;

// =============================================================================
// Bootstrap Configuration
// =============================================================================

/// Store connectivity retry policy used by bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BootstrapConfig {
    /// Maximum connection attempts
    pub max_attempts: u32,
    /// Overall budget for all attempts in seconds
    pub timeout_secs: u64,
    /// Fixed delay between attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            timeout_secs: 30,
            retry_delay_ms: 1000,
        }
    }
}

impl BootstrapConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// =============================================================================
// Self-Healing Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HealingConfig {
    pub enabled: bool,
    /// Pass interval in seconds
    pub interval_secs: u64,
    /// How long a session must stay unhealthy before it is repaired
    pub wait_window_secs: u64,
    /// Bound on each inspect/repair call
    pub item_timeout_secs: u64,
    /// Concurrent session inspections per pass
    pub concurrency: usize,
    /// Only heal publications on this node
    pub node_name: Option<String>,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            wait_window_secs: 420,
            item_timeout_secs: 60,
            concurrency: 8,
            node_name: None,
        }
    }
}

impl HealingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn wait_window(&self) -> Duration {
        Duration::from_secs(self.wait_window_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_secs(self.item_timeout_secs)
    }
}

// =============================================================================
// Platform Configuration
// =============================================================================

/// Supported container platform version range
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlatformConfig {
    pub min_version: String,
    pub max_version: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            min_version: KUBERNETES_VERSION_MIN.to_string(),
            max_version: KUBERNETES_VERSION_MAX.to_string(),
        }
    }
}

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Orchestrator instance name
    pub orchestrator_name: String,
    pub api_version: u32,
    /// Per-call store timeout in seconds
    pub store_timeout_secs: u64,
    pub bootstrap: BootstrapConfig,
    pub healing: HealingConfig,
    pub platform: PlatformConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            orchestrator_name: DEFAULT_ORCHESTRATOR_NAME.to_string(),
            api_version: DEFAULT_API_VERSION,
            store_timeout_secs: 10,
            bootstrap: BootstrapConfig::default(),
            healing: HealingConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse a YAML document; absent fields keep their defaults
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.orchestrator_name.is_empty() || self.orchestrator_name.contains('/') {
            return Err(Error::Configuration(format!(
                "invalid orchestrator name '{}'",
                self.orchestrator_name
            )));
        }
        if self.bootstrap.max_attempts == 0 {
            return Err(Error::Configuration(
                "bootstrap.maxAttempts must be at least 1".into(),
            ));
        }
        if self.healing.concurrency == 0 {
            return Err(Error::Configuration(
                "healing.concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    /// Path prefix of the REST API, e.g. `/vorch/v1`
    pub fn api_base_path(&self) -> String {
        format!("/{}/v{}", self.orchestrator_name, self.api_version)
    }
}
