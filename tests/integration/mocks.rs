//! In-memory collaborators for integration testing.
//!
//! `MockFunds` serves a controllable `FundsStatus` and counts queries;
//! `MockLedger` records every transaction and applies liquidity removals
//! back onto the funds so remediation can be verified end to end.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lpsentinel::engine::executor::TransactionExecutor;
use lpsentinel::engine::funds::FundsManager;
use lpsentinel::types::*;

/// A funds manager whose report is fully controllable from test code.
pub struct MockFunds {
    funds: Mutex<FundsStatus>,
    /// Number of upcoming queries that fail.
    failures: AtomicUsize,
    calls: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MockFunds {
    pub fn new(funds: FundsStatus) -> Arc<Self> {
        Arc::new(Self {
            funds: Mutex::new(funds),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        })
    }

    /// Funds that score low risk: plenty of free SOL, two positions.
    pub fn healthy() -> Arc<Self> {
        Self::new(funds(5.0, 10.0, vec![("pool-a", 600.0), ("pool-b", 400.0)]))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> FundsStatus {
        self.funds.lock().unwrap().clone()
    }

    pub fn set_funds(&self, funds: FundsStatus) {
        *self.funds.lock().unwrap() = funds;
    }

    /// Fail the next `n` queries.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make every query take `delay` (tokio time).
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Remove `percentage`% of a pool's value; the position disappears once
    /// it is fully withdrawn.
    fn withdraw(&self, pool: &str, percentage: f64) {
        let mut funds = self.funds.lock().unwrap();
        for position in funds.positions.iter_mut().filter(|p| p.pool_address == pool) {
            position.value_usd *= 1.0 - percentage / 100.0;
        }
        funds.positions.retain(|p| p.value_usd > 1e-9);
    }
}

#[async_trait]
impl FundsManager for MockFunds {
    async fn get_funds_status(&self, _agent_id: &str, _wallet_address: &str) -> Result<FundsStatus> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("funds source unavailable"));
        }
        Ok(self.current())
    }
}

/// Records transactions and applies removals to the backing `MockFunds`.
pub struct MockLedger {
    funds: Arc<MockFunds>,
    requests: Mutex<Vec<TransactionRequest>>,
}

impl MockLedger {
    pub fn new(funds: Arc<MockFunds>) -> Arc<Self> {
        Arc::new(Self {
            funds,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<TransactionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransactionExecutor for MockLedger {
    async fn execute_transaction(&self, request: TransactionRequest) -> Result<TransactionOutcome> {
        if request.tx_type == TransactionType::RemoveLiquidity {
            let pct = request.data["percentage"].as_f64().unwrap_or(0.0);
            if let Some(pool) = request.pool_address() {
                self.funds.withdraw(pool, pct);
            }
        }
        let n = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request);
            requests.len()
        };
        Ok(TransactionOutcome::ok(format!("sig-{n}")))
    }
}

pub fn funds(available_sol: f64, total_value_sol: f64, positions: Vec<(&str, f64)>) -> FundsStatus {
    FundsStatus {
        total_value_usd: positions.iter().map(|(_, v)| v).sum::<f64>() + available_sol * 150.0,
        total_value_sol,
        available_sol,
        positions: positions
            .into_iter()
            .map(|(pool, value)| Position::new(pool, value))
            .collect(),
    }
}
