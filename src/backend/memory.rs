//! In-memory backend domain.
//!
//! Keeps a history of every closed transaction and counts how many are open
//! at once. Latency and open failures can be injected to exercise the
//! driver's pipelining and stopping paths without a real storage engine.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::Backend;
use crate::credit::Budget;
use crate::error::{Error, Result};

/// A transaction opened by [`MemoryDomain`].
#[derive(Debug)]
pub struct MemoryTx {
    id: u64,
    budget: Budget,
    used: Budget,
    captures: u64,
}

impl MemoryTx {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Budget the transaction was opened with.
    pub fn budget(&self) -> Budget {
        self.budget
    }

    /// Record a capture of `share` against this transaction.
    pub fn capture(&mut self, share: Budget) {
        self.used += share;
        self.captures += 1;
    }
}

/// What a closed transaction reserved and what was captured in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub id: u64,
    pub budget: Budget,
    pub used: Budget,
    pub captures: u64,
}

impl TxRecord {
    /// Captured no more than was reserved.
    pub fn is_within_budget(&self) -> bool {
        self.used.fits_within(self.budget)
    }
}

#[derive(Debug, Default)]
struct DomainState {
    open_attempts: u64,
    open_failures: u64,
    next_id: u64,
    open_now: usize,
    open_max: usize,
    history: Vec<TxRecord>,
}

/// In-process [`Backend`].
#[derive(Debug)]
pub struct MemoryDomain {
    limit: Budget,
    open_latency: Duration,
    close_latency: Duration,
    fail_open_at: Option<u64>,
    state: Mutex<DomainState>,
}

impl MemoryDomain {
    /// A domain whose transactions may reserve at most `limit`.
    pub fn new(limit: Budget) -> Self {
        Self {
            limit,
            open_latency: Duration::ZERO,
            close_latency: Duration::ZERO,
            fail_open_at: None,
            state: Mutex::new(DomainState::default()),
        }
    }

    pub fn with_open_latency(mut self, latency: Duration) -> Self {
        self.open_latency = latency;
        self
    }

    pub fn with_close_latency(mut self, latency: Duration) -> Self {
        self.close_latency = latency;
        self
    }

    /// Fail the `n`-th open attempt (1-based).
    pub fn fail_open_at(mut self, n: u64) -> Self {
        self.fail_open_at = Some(n);
        self
    }

    /// Open attempts so far, successful or not.
    pub fn open_attempts(&self) -> u64 {
        self.state.lock().open_attempts
    }

    pub fn open_failures(&self) -> u64 {
        self.state.lock().open_failures
    }

    /// Transactions currently open.
    pub fn open_now(&self) -> usize {
        self.state.lock().open_now
    }

    /// Highest number of transactions that were open at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.state.lock().open_max
    }

    /// Closed transactions in close order.
    pub fn history(&self) -> Vec<TxRecord> {
        self.state.lock().history.clone()
    }

    pub fn closed(&self) -> usize {
        self.state.lock().history.len()
    }
}

impl Backend for MemoryDomain {
    type Tx = MemoryTx;

    fn tx_limit(&self) -> Budget {
        self.limit
    }

    async fn open(&self, budget: Budget) -> Result<MemoryTx> {
        if !self.open_latency.is_zero() {
            tokio::time::sleep(self.open_latency).await;
        }

        let mut state = self.state.lock();
        state.open_attempts += 1;

        if self.fail_open_at == Some(state.open_attempts) {
            state.open_failures += 1;
            return Err(Error::TxOpen {
                budget,
                reason: format!("injected failure on open #{}", state.open_attempts),
            });
        }
        if !budget.fits_within(self.limit) {
            state.open_failures += 1;
            return Err(Error::TxOpen {
                budget,
                reason: format!("exceeds transaction limit {}", self.limit),
            });
        }

        state.next_id += 1;
        state.open_now += 1;
        state.open_max = state.open_max.max(state.open_now);

        let id = state.next_id;
        drop(state);

        debug!(tx = id, %budget, "memory tx opened");
        Ok(MemoryTx {
            id,
            budget,
            used: Budget::ZERO,
            captures: 0,
        })
    }

    async fn close(&self, tx: MemoryTx) {
        if !self.close_latency.is_zero() {
            tokio::time::sleep(self.close_latency).await;
        }

        let mut state = self.state.lock();
        state.open_now = state.open_now.saturating_sub(1);
        state.history.push(TxRecord {
            id: tx.id,
            budget: tx.budget,
            used: tx.used,
            captures: tx.captures,
        });
        drop(state);

        debug!(tx = tx.id, captures = tx.captures, "memory tx closed");
    }
}
