//! Session Self-Healing Loop
//!
//! Each pass:
//!
//! 1. snapshot the iSCSI publications (optionally only this node's)
//! 2. group them into sessions and inspect each one concurrently
//! 3. repair sessions unhealthy for at least the wait window
//! 4. open encrypted volumes on healthy sessions, formatting a device at
//!    most once and never when it already carries a LUKS header
//!
//! Per-item failures are logged and counted; they never end the loop.

use crate::config::HealingConfig;
use crate::domain::ports::{
    IscsiClientRef, LuksDeviceProviderRef, PassphraseSourceRef, PublicationSourceRef,
    PublishedVolume, SessionTarget,
};
use crate::domain::SessionState;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one healing pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub sessions: usize,
    pub healthy: usize,
    /// Unhealthy but still inside the wait window
    pub deferred: usize,
    pub repaired: usize,
    pub luks_opened: usize,
    pub luks_formatted: usize,
    pub failures: usize,
}

/// What happened to an encrypted volume during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LuksAction {
    AlreadyOpen,
    Opened,
    FormattedAndOpened,
}

/// Identity of one device within one volume lifecycle
type FormatKey = (String, i64, String);

pub struct SessionSelfHealer {
    config: HealingConfig,
    source: PublicationSourceRef,
    iscsi: IscsiClientRef,
    luks: LuksDeviceProviderRef,
    passphrases: PassphraseSourceRef,
    metrics: Arc<Metrics>,
    /// When each session was first seen unhealthy; cleared once healthy
    first_unhealthy: Mutex<HashMap<SessionTarget, Instant>>,
    /// Devices this process has formatted
    formatted: Mutex<HashSet<FormatKey>>,
}

impl SessionSelfHealer {
    pub fn new(
        config: HealingConfig,
        source: PublicationSourceRef,
        iscsi: IscsiClientRef,
        luks: LuksDeviceProviderRef,
        passphrases: PassphraseSourceRef,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            source,
            iscsi,
            luks,
            passphrases,
            metrics,
            first_unhealthy: Mutex::new(HashMap::new()),
            formatted: Mutex::new(HashSet::new()),
        })
    }

    /// Run passes on the configured interval until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Self-healing loop started: interval {:?}, wait window {:?}",
            self.config.interval(),
            self.config.wait_window()
        );

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Self-healing loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    let report = self.tick_at(Instant::now()).await;
                    if report.sessions > 0 {
                        info!(
                            "Healing pass: {} session(s), {} repaired, {} deferred, {} failure(s)",
                            report.sessions, report.repaired, report.deferred, report.failures
                        );
                    }
                }
            }
        }
    }

    /// One pass, with `now` as the reference point for the wait window
    pub async fn tick_at(&self, now: Instant) -> PassReport {
        self.metrics.healing_passes.inc();
        let mut report = PassReport::default();

        let published = self
            .source
            .iscsi_publications(self.config.node_name.as_deref());
        let sessions = group_by_session(published);
        report.sessions = sessions.len();
        self.metrics
            .sessions_inspected
            .inc_by(sessions.len() as u64);

        let concurrency = self.config.concurrency.max(1);

        // Inspect
        let inspections: Vec<_> = sessions
            .keys()
            .cloned()
            .map(|target| self.inspect(target))
            .collect();
        let inspected: Vec<(SessionTarget, Result<SessionState>)> = stream::iter(inspections)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut healthy = Vec::new();
        let mut to_repair = Vec::new();
        {
            let mut first_unhealthy = self.first_unhealthy.lock();
            for (target, state) in inspected {
                match state {
                    Ok(SessionState::Healthy) => {
                        first_unhealthy.remove(&target);
                        healthy.push(target);
                    }
                    Ok(state) => {
                        let since = *first_unhealthy.entry(target.clone()).or_insert(now);
                        let waited = now.saturating_duration_since(since);
                        if waited >= self.config.wait_window() {
                            to_repair.push((target, state));
                        } else {
                            debug!(
                                "Session {} {} for {:?}, waiting",
                                target, state, waited
                            );
                            report.deferred += 1;
                        }
                    }
                    Err(e) => {
                        warn!("Could not inspect session {}: {}", target, e);
                        report.failures += 1;
                    }
                }
            }
            // Forget sessions that are no longer published
            first_unhealthy.retain(|target, _| sessions.contains_key(target));
        }
        report.healthy = healthy.len();

        // Repair. A failed session keeps its first-unhealthy mark, so the
        // next pass retries it without waiting out the window again.
        let repairs: Vec<_> = to_repair
            .into_iter()
            .map(|(target, state)| self.repair(target, state))
            .collect();
        let repaired: Vec<(SessionTarget, Result<()>)> = stream::iter(repairs)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (target, outcome) in repaired {
            match outcome {
                Ok(()) => {
                    info!("Repaired session {}", target);
                    self.first_unhealthy.lock().remove(&target);
                    self.metrics.sessions_repaired.inc();
                    report.repaired += 1;
                }
                Err(e) => {
                    error!("Failed to repair session {}, retrying next pass: {}", target, e);
                    report.failures += 1;
                }
            }
        }

        // Encrypted volumes on healthy sessions
        let unlocks: Vec<_> = healthy
            .iter()
            .filter_map(|target| sessions.get(target))
            .flatten()
            .filter(|p| p.volume.is_encrypted())
            .cloned()
            .map(|published| self.unlock(published))
            .collect();
        let luks_results: Vec<(PublishedVolume, Result<LuksAction>)> = stream::iter(unlocks)
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (published, outcome) in luks_results {
            match outcome {
                Ok(LuksAction::AlreadyOpen) => {}
                Ok(LuksAction::Opened) => report.luks_opened += 1,
                Ok(LuksAction::FormattedAndOpened) => {
                    report.luks_formatted += 1;
                    report.luks_opened += 1;
                }
                Err(e) => {
                    error!(
                        "LUKS handling failed for volume {}: {}",
                        published.volume.name, e
                    );
                    report.failures += 1;
                }
            }
        }

        self.metrics
            .healing_failures
            .inc_by(report.failures as u64);
        report
    }

    /// Bound `work` by the per-item timeout
    async fn bounded<T>(
        &self,
        what: &str,
        target: &SessionTarget,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.item_timeout(), work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Iscsi {
                target: target.to_string(),
                reason: format!(
                    "{} timed out after {:?}",
                    what,
                    self.config.item_timeout()
                ),
            }),
        }
    }

    async fn inspect(&self, target: SessionTarget) -> (SessionTarget, Result<SessionState>) {
        let state = self
            .bounded("inspect", &target, self.iscsi.inspect(&target))
            .await;
        (target, state)
    }

    async fn repair(
        &self,
        target: SessionTarget,
        state: SessionState,
    ) -> (SessionTarget, Result<()>) {
        let outcome = self.relogin(&target, state).await;
        (target, outcome)
    }

    async fn relogin(&self, target: &SessionTarget, state: SessionState) -> Result<()> {
        match state {
            SessionState::Healthy => Ok(()),
            SessionState::Missing => {
                info!("Session {} missing, logging in", target);
                self.bounded("login", target, self.iscsi.login(target)).await
            }
            SessionState::Stale => {
                info!("Session {} stale, logging out and back in", target);
                self.bounded("logout", target, self.iscsi.logout(target))
                    .await?;
                self.bounded("login", target, self.iscsi.login(target)).await
            }
        }
    }

    async fn unlock(&self, published: PublishedVolume) -> (PublishedVolume, Result<LuksAction>) {
        let target = SessionTarget {
            node_name: published.publication.node_name.clone(),
            target_portal: published
                .publication
                .target_portal
                .clone()
                .unwrap_or_default(),
            iqn: published.publication.target_iqn.clone().unwrap_or_default(),
        };
        let outcome = self
            .bounded("luks", &target, self.ensure_luks_open(&published))
            .await;
        (published, outcome)
    }

    async fn ensure_luks_open(&self, published: &PublishedVolume) -> Result<LuksAction> {
        let volume = &published.volume;
        let luks_ref = match &volume.luks {
            Some(luks_ref) => luks_ref,
            None => return Ok(LuksAction::AlreadyOpen),
        };
        let device = self.luks.device_for(volume, &published.publication);
        if device.is_open().await? {
            return Ok(LuksAction::AlreadyOpen);
        }

        let passphrase = self.passphrases.passphrase(luks_ref).await?;
        let mut action = LuksAction::Opened;

        if !device.is_luks_formatted().await? {
            let key: FormatKey = (
                volume.internal_name.clone(),
                volume.created_at.timestamp_micros(),
                device.device_path().to_string(),
            );
            let luks_error = |reason: &str| Error::Luks {
                device: device.device_path().to_string(),
                reason: reason.to_string(),
            };
            if published.publication.read_only {
                return Err(luks_error("refusing to format a read-only publication"));
            }
            // Recorded before formatting so a failed attempt is not repeated
            if !self.formatted.lock().insert(key) {
                return Err(luks_error(
                    "device was formatted once already and lost its header; not formatting again",
                ));
            }
            info!(
                "Formatting {} for volume {}",
                device.device_path(),
                volume.name
            );
            device.luks_format(&passphrase).await?;
            self.metrics.luks_formats.inc();
            action = LuksAction::FormattedAndOpened;
        }

        device.open(&passphrase).await?;
        self.metrics.luks_opens.inc();
        Ok(action)
    }
}

/// Publications keyed by the session that carries them
fn group_by_session(
    published: Vec<PublishedVolume>,
) -> BTreeMap<SessionTarget, Vec<PublishedVolume>> {
    let mut sessions: BTreeMap<SessionTarget, Vec<PublishedVolume>> = BTreeMap::new();
    for item in published {
        let (Some(portal), Some(iqn)) = (
            item.publication.target_portal.clone(),
            item.publication.target_iqn.clone(),
        ) else {
            continue;
        };
        let target = SessionTarget {
            node_name: item.publication.node_name.clone(),
            target_portal: portal,
            iqn,
        };
        sessions.entry(target).or_default().push(item);
    }
    sessions
}
