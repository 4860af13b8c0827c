//! Prometheus metrics
//!
//! Collectors are owned by a private `Registry` so several orchestrators can
//! coexist in one process (tests do). The metrics server gathers from
//! `Metrics::registry`.

use crate::error::{Error, Result};
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    registry: Registry,
    /// Lifecycle operations by `operation` and `outcome`
    pub operations: IntCounterVec,
    pub pending_transactions: IntGauge,
    pub backends: IntGauge,
    pub volumes: IntGauge,
    pub healing_passes: IntCounter,
    pub sessions_inspected: IntCounter,
    pub sessions_repaired: IntCounter,
    pub healing_failures: IntCounter,
    pub luks_formats: IntCounter,
    pub luks_opens: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("vorch".to_string()), None)
            .map_err(metrics_error)?;

        let operations = IntCounterVec::new(
            Opts::new("operations_total", "Lifecycle operations by outcome"),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;
        let pending_transactions = IntGauge::new(
            "pending_transactions",
            "Transactions begun but not yet resolved",
        )
        .map_err(metrics_error)?;
        let backends =
            IntGauge::new("backends", "Registered backends").map_err(metrics_error)?;
        let volumes = IntGauge::new("volumes", "Known volumes").map_err(metrics_error)?;
        let healing_passes = IntCounter::new("healing_passes_total", "Self-healing passes run")
            .map_err(metrics_error)?;
        let sessions_inspected =
            IntCounter::new("sessions_inspected_total", "iSCSI sessions inspected")
                .map_err(metrics_error)?;
        let sessions_repaired =
            IntCounter::new("sessions_repaired_total", "iSCSI sessions repaired")
                .map_err(metrics_error)?;
        let healing_failures = IntCounter::new(
            "healing_failures_total",
            "Per-item self-healing failures",
        )
        .map_err(metrics_error)?;
        let luks_formats = IntCounter::new("luks_formats_total", "LUKS devices formatted")
            .map_err(metrics_error)?;
        let luks_opens = IntCounter::new("luks_opens_total", "LUKS devices opened")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(pending_transactions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(backends.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(volumes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(healing_passes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(sessions_inspected.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(sessions_repaired.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(healing_failures.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(luks_formats.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(luks_opens.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            pending_transactions,
            backends,
            volumes,
            healing_passes,
            sessions_inspected,
            sessions_repaired,
            healing_failures,
            luks_formats,
            luks_opens,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_operation(&self, operation: &str, result: &Result<impl Sized>) {
        let outcome = match result {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        self.operations
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Render every collector in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        use prometheus::{Encoder, TextEncoder};

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
