//! Backend transaction contract consumed by the bulk driver.
//!
//! The driver never looks inside a transaction. It opens one sized to the
//! budget it packed, hands it to the work source for each packed item, and
//! closes it. [`memory::MemoryDomain`] is an in-process implementation for
//! tests and the demo binary.

pub mod memory;

use std::future::Future;

use crate::credit::Budget;
use crate::error::Result;

pub use memory::{MemoryDomain, MemoryTx, TxRecord};

/// A backend domain able to open and close transactions.
pub trait Backend: Send + Sync + 'static {
    /// An open transaction. Owned by exactly one worker at a time.
    type Tx: Send + 'static;

    /// Largest budget a single transaction may be opened with.
    fn tx_limit(&self) -> Budget;

    /// Open a transaction reserving `budget`.
    ///
    /// Failure is fatal for the bulk run: the error is recorded and every
    /// worker stops pulling new work.
    fn open(&self, budget: Budget) -> impl Future<Output = Result<Self::Tx>> + Send;

    /// Close a transaction opened by [`open`](Self::open).
    fn close(&self, tx: Self::Tx) -> impl Future<Output = ()> + Send;
}
