//! Transaction Log
//!
//! Records intent before and outcome after every mutating operation. The
//! per-target reservation is what serializes operations on one entity: it is
//! taken atomically before the durable write and only released once the
//! resolution is durable. A pending clone additionally pins its source
//! volume against deletion.

use crate::error::{Error, Result};
use crate::store::{KeyLayout, StoreExt, StoreRef};
use crate::txn::op::{Transaction, TransactionStatus, TxnOp};
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

// =============================================================================
// Configuration
// =============================================================================

/// Retry policy for commit/abort writes
#[derive(Debug, Clone)]
pub struct ResolveRetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up after this long and leave the target reserved
    pub max_elapsed: Duration,
}

impl Default for ResolveRetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(15),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Proof that a pending transaction is durable and its target reserved.
///
/// Consumed by `commit` or `abort`; deliberately not `Clone`.
#[derive(Debug)]
#[must_use = "a pending transaction must be committed or aborted"]
pub struct TxnHandle {
    record: Transaction,
}

impl TxnHandle {
    pub fn id(&self) -> Uuid {
        self.record.id
    }

    pub fn target_id(&self) -> &str {
        &self.record.target_id
    }

    pub fn op(&self) -> &TxnOp {
        &self.record.operation
    }

    pub fn record(&self) -> &Transaction {
        &self.record
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    txn_id: Uuid,
    op: &'static str,
    source: Option<String>,
}

// =============================================================================
// Transaction Log
// =============================================================================

pub struct TransactionLog {
    store: StoreRef,
    keys: KeyLayout,
    /// target id -> pending transaction
    reservations: DashMap<String, Reservation>,
    /// Serializes admission checks that span more than one target
    admission: Mutex<()>,
    retry: ResolveRetryConfig,
}

impl TransactionLog {
    pub fn new(store: StoreRef, keys: KeyLayout) -> Self {
        Self::with_retry(store, keys, ResolveRetryConfig::default())
    }

    pub fn with_retry(store: StoreRef, keys: KeyLayout, retry: ResolveRetryConfig) -> Self {
        Self {
            store,
            keys,
            reservations: DashMap::new(),
            admission: Mutex::new(()),
            retry,
        }
    }

    /// Reserve the target and durably record intent
    pub async fn begin(&self, op: TxnOp) -> Result<TxnHandle> {
        let record = Transaction::pending(op);
        self.reserve(&record)?;

        let key = self.keys.transaction(&record.id);
        if let Err(e) = self.store.put_record(&key, &record).await {
            self.release(&record.target_id, record.id);
            return Err(e);
        }

        debug!(
            "Began {} transaction {} for {}",
            record.operation.name(),
            record.id,
            record.target_id
        );
        Ok(TxnHandle { record })
    }

    /// Take over a pending record found in the store during bootstrap
    pub fn adopt(&self, record: Transaction) -> Result<TxnHandle> {
        if !record.is_pending() {
            return Err(Error::Internal(format!(
                "cannot adopt {} transaction {}",
                record.status, record.id
            )));
        }
        self.reserve(&record)?;
        Ok(TxnHandle { record })
    }

    pub async fn commit(&self, handle: TxnHandle) -> Result<Transaction> {
        self.resolve(handle.record, TransactionStatus::Committed, None)
            .await
    }

    pub async fn abort(&self, handle: TxnHandle, reason: impl Into<String>) -> Result<Transaction> {
        self.resolve(handle.record, TransactionStatus::RolledBack, Some(reason.into()))
            .await
    }

    /// Roll back a pending record that could not be adopted
    pub async fn discard(&self, record: Transaction, reason: impl Into<String>) -> Result<()> {
        let mut record = record;
        record.status = TransactionStatus::RolledBack;
        record.reason = Some(reason.into());
        record.updated_at = Utc::now();
        self.store
            .put_record(&self.keys.transaction(&record.id), &record)
            .await
    }

    fn reserve(&self, record: &Transaction) -> Result<()> {
        let _admission = self.admission.lock();
        let source = record.operation.source_target();
        match &record.operation {
            TxnOp::DeleteVolume { .. } => {
                if let Some(clone) = self.pinning_clone(&record.target_id) {
                    return Err(Error::ConflictingTransaction {
                        target: record.target_id.clone(),
                        pending_op: clone.to_string(),
                    });
                }
            }
            TxnOp::CloneVolume { .. } => {
                if let Some(source) = source.as_deref() {
                    if self.pending_op(source) == Some("DeleteVolume") {
                        return Err(Error::ConflictingTransaction {
                            target: source.to_string(),
                            pending_op: "DeleteVolume".to_string(),
                        });
                    }
                }
            }
            _ => {}
        }

        match self.reservations.entry(record.target_id.clone()) {
            Entry::Occupied(existing) => Err(Error::ConflictingTransaction {
                target: record.target_id.clone(),
                pending_op: existing.get().op.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Reservation {
                    txn_id: record.id,
                    op: record.operation.name(),
                    source,
                });
                Ok(())
            }
        }
    }

    fn pinning_clone(&self, source: &str) -> Option<&'static str> {
        self.reservations
            .iter()
            .find(|entry| entry.source.as_deref() == Some(source))
            .map(|entry| entry.op)
    }

    fn release(&self, target: &str, txn_id: Uuid) {
        self.reservations
            .remove_if(target, |_, reservation| reservation.txn_id == txn_id);
    }

    async fn resolve(
        &self,
        mut record: Transaction,
        status: TransactionStatus,
        reason: Option<String>,
    ) -> Result<Transaction> {
        record.status = status;
        record.reason = reason;
        record.updated_at = Utc::now();

        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_interval)
            .with_max_interval(self.retry.max_interval)
            .with_max_elapsed_time(Some(self.retry.max_elapsed))
            .build();

        let key = self.keys.transaction(&record.id);
        let store = &self.store;
        let key_ref = &key;
        let record_ref = &record;
        let written = backoff::future::retry_notify(
            policy,
            || async move {
                store
                    .put_record(key_ref, record_ref)
                    .await
                    .map_err(|e| {
                        if e.is_transient() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
            },
            |e, wait| warn!("Retrying resolution of transaction {} in {:?}: {}", key_ref, wait, e),
        )
        .await;

        match written {
            Ok(()) => {
                self.release(&record.target_id, record.id);
                debug!(
                    "Transaction {} for {} resolved as {}",
                    record.id, record.target_id, record.status
                );
                Ok(record)
            }
            Err(e) => {
                error!(
                    "Could not persist {} for transaction {} on {}; target stays reserved until restart: {}",
                    status, record.id, record.target_id, e
                );
                Err(e)
            }
        }
    }

    /// Pending records in the order they were begun
    pub async fn list_pending(&self) -> Result<Vec<Transaction>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(Transaction::is_pending)
            .collect())
    }

    /// Every persisted record, oldest first
    pub async fn list(&self) -> Result<Vec<Transaction>> {
        let mut records: Vec<Transaction> = self
            .store
            .list_records::<Transaction>(&self.keys.transactions())
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Delete resolved records, returning how many were removed
    pub async fn compact(&self) -> Result<usize> {
        let resolved: Vec<Transaction> = self
            .list()
            .await?
            .into_iter()
            .filter(|r| !r.is_pending())
            .collect();

        for record in &resolved {
            self.store.delete(&self.keys.transaction(&record.id)).await?;
        }
        if !resolved.is_empty() {
            info!("Compacted {} resolved transactions", resolved.len());
        }
        Ok(resolved.len())
    }

    /// Number of reserved targets
    pub fn pending_count(&self) -> usize {
        self.reservations.len()
    }

    /// Name of the pending operation on `target`, if any
    pub fn pending_op(&self, target: &str) -> Option<&'static str> {
        self.reservations.get(target).map(|r| r.op)
    }
}
