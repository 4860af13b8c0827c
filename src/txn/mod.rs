//! Transaction Log for crash recovery
//!
//! ```text
//!   begin(op) ──► reserve target ──► put Pending ──► TxnHandle
//!                                                      │
//!                         commit / abort ◄─────────────┘
//!                               │
//!                   put Committed / RolledBack ──► release target
//! ```
//!
//! Records left Pending by a crash are replayed by bootstrap according to
//! the operation's `Idempotency`.

mod log;
mod op;

pub use log::{ResolveRetryConfig, TransactionLog, TxnHandle};
pub use op::{
    backend_target, snapshot_target, volume_target, Idempotency, Transaction,
    TransactionStatus, TxnOp,
};

#[cfg(test)]
pub(crate) use op::fixtures;
