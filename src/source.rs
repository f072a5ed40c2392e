//! Work source: the producer side of a bulk run.
//!
//! A source hands out opaque items, tells the driver how much budget each
//! one needs, and executes an item inside a backend transaction. The
//! source object doubles as the user datum: whatever state the callbacks
//! share lives in `self`.
//!
//! All three methods may be called concurrently from different localities.

use std::future::Future;

use crate::backend::Backend;
use crate::credit::Budget;
use crate::error::Result;
use crate::model::WorkerId;

pub trait WorkSource<B: Backend>: Send + Sync + 'static {
    /// One unit of work. Opaque to the driver.
    type Item: Send + 'static;

    /// Produce the next item for `worker`.
    ///
    /// `Ok(None)` means the source is exhausted and is not an error. Any
    /// `Err` is fatal: the bulk records it and stops.
    fn next(&self, worker: WorkerId) -> impl Future<Output = Result<Option<Self::Item>>> + Send;

    /// Add the budget needed to transact `item` into `accum`.
    ///
    /// Must not have side effects beyond the accumulation; the driver may
    /// call it on an item that ends up in a later transaction.
    fn credit(&self, item: &Self::Item, accum: &mut Budget);

    /// Do the work for `item` inside `tx`.
    ///
    /// One transaction may host several `execute` calls, made in the order
    /// `next` produced the items on that worker.
    fn execute(
        &self,
        worker: WorkerId,
        tx: &mut B::Tx,
        item: Self::Item,
    ) -> impl Future<Output = ()> + Send;
}
