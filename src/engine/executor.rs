//! Transaction executor.
//!
//! Executes single remediation transactions (remove liquidity, swap to
//! SOL) on behalf of the risk controller. Building and broadcasting real
//! ledger transactions lives outside this crate; the bundled
//! `DryRunExecutor` logs what would be sent and always succeeds.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::types::{TransactionOutcome, TransactionRequest};

/// Executes one remediation transaction and reports the outcome.
///
/// An `Err` means the executor itself failed (e.g. RPC unreachable); an
/// `Ok` outcome with `success == false` means the transaction was
/// attempted and rejected. Callers treat both as a failed step.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionExecutor: Send + Sync {
    async fn execute_transaction(&self, request: TransactionRequest) -> Result<TransactionOutcome>;
}

// ---------------------------------------------------------------------------
// Dry-run executor
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct DryRunExecutor {
    executed: AtomicU64,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transactions "executed" so far.
    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransactionExecutor for DryRunExecutor {
    async fn execute_transaction(&self, request: TransactionRequest) -> Result<TransactionOutcome> {
        info!(
            agent_id = %request.agent_id,
            tx_type = %request.tx_type,
            priority = %request.priority,
            pool = request.pool_address().unwrap_or("-"),
            data = %request.data,
            "[DRY RUN] Would execute transaction"
        );
        self.executed.fetch_add(1, Ordering::Relaxed);
        Ok(TransactionOutcome::ok(format!("dry-run-{}", uuid::Uuid::new_v4())))
    }
}
