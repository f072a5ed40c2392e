//! Core data model.
//!
//! Identifiers, the worker lifecycle state and the reports a bulk run
//! produces. The driver itself lives in [`crate::bulk`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for bulk run IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BulkId(pub Uuid);

impl BulkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for BulkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for BulkId {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of a worker, equal to the index of the locality it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Worker state
// ---------------------------------------------------------------------------

/// Lifecycle state of a bulk worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Between transactions. Initial state.
    Idle,
    /// Waiting for the source to produce an item.
    NeedItem,
    /// Deciding whether the new item joins the current pack.
    GotItem,
    /// Waiting for the backend to open a transaction.
    OpenTx,
    /// Executing the packed items inside the open transaction.
    DoItems,
    /// Waiting for the transaction to close.
    CloseTx,
    /// The source is exhausted.
    Drained,
    /// Transaction open failed; packed items are dropped.
    CloseOnFailure,
    /// Terminal.
    Finished,
}

impl WorkerState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Idle, NeedItem)
                | (Idle, Finished)      // stopping
                | (NeedItem, GotItem)
                | (NeedItem, OpenTx)    // flush before draining or stopping
                | (NeedItem, Drained)
                | (NeedItem, Finished)  // source error or stopping, nothing packed
                | (GotItem, NeedItem)
                | (GotItem, OpenTx)
                | (OpenTx, DoItems)
                | (OpenTx, CloseOnFailure)
                | (DoItems, CloseTx)
                | (CloseTx, Idle)
                | (CloseTx, Drained)
                | (Drained, Finished)
                | (CloseOnFailure, Finished)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Finished)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::NeedItem => "need_item",
            WorkerState::GotItem => "got_item",
            WorkerState::OpenTx => "open_tx",
            WorkerState::DoItems => "do_items",
            WorkerState::CloseTx => "close_tx",
            WorkerState::Drained => "drained",
            WorkerState::CloseOnFailure => "close_on_failure",
            WorkerState::Finished => "finished",
        }
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// What one worker did, published when it reaches [`WorkerState::Finished`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker: WorkerId,
    pub state: WorkerState,
    /// Calls to the source's `next`.
    pub next_nr: u64,
    /// Transactions opened and closed.
    pub tx_nr: u64,
    /// Items executed inside those transactions.
    pub item_nr: u64,
    /// Whether the worker saw the source run dry.
    pub drained: bool,
}

impl WorkerSummary {
    pub fn new(worker: WorkerId) -> Self {
        Self {
            worker,
            state: WorkerState::Idle,
            next_nr: 0,
            tx_nr: 0,
            item_nr: 0,
            drained: false,
        }
    }
}

/// Aggregate result of a completed bulk run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkReport {
    pub id: BulkId,
    pub worker_nr: usize,
    pub tx_nr: u64,
    pub item_nr: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` on success, otherwise the first fatal error.
    pub error: Option<String>,
    pub workers: Vec<WorkerSummary>,
}

impl BulkReport {
    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
