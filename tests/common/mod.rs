//! Shared fixtures for bulk integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use txbulk::backend::{MemoryDomain, MemoryTx};
use txbulk::{Budget, Bulk, BulkConfig, Credit, Error, Localities, Op, WorkSource, WorkerId};

/// One `execute` call as seen by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exec {
    pub worker: WorkerId,
    pub tx: u64,
    pub item: u64,
}

#[derive(Default)]
struct SourceState {
    next_calls: u64,
    /// `next` calls that started while the bulk was already stopping.
    next_after_stopping: u64,
    produced: u64,
    /// (worker, item) in production order.
    produced_by: Vec<(WorkerId, u64)>,
    executed: Vec<Exec>,
}

/// A source producing `total` identical items, optionally failing after
/// `fail_after` of them or panicking on a chosen item.
pub struct ScriptedSource {
    total: u64,
    share: Budget,
    fail_after: Option<u64>,
    panic_in_next_at: Option<u64>,
    panic_in_execute_at: Option<u64>,
    bulk: OnceLock<Weak<Bulk<ScriptedSource, MemoryDomain>>>,
    state: Mutex<SourceState>,
}

impl ScriptedSource {
    pub fn new(total: u64, share: Budget) -> Self {
        Self {
            total,
            share,
            fail_after: None,
            panic_in_next_at: None,
            panic_in_execute_at: None,
            bulk: OnceLock::new(),
            state: Mutex::new(SourceState::default()),
        }
    }

    /// `next` panics once `n` items have been produced.
    pub fn panic_in_next_at(mut self, n: u64) -> Self {
        self.panic_in_next_at = Some(n);
        self
    }

    /// `execute` panics on item `item`.
    pub fn panic_in_execute_at(mut self, item: u64) -> Self {
        self.panic_in_execute_at = Some(item);
        self
    }

    /// Observe `bulk` so `next` calls made after it started stopping are
    /// counted.
    pub fn watch(&self, bulk: &Arc<Bulk<ScriptedSource, MemoryDomain>>) {
        let _ = self.bulk.set(Arc::downgrade(bulk));
    }

    fn bulk_is_stopping(&self) -> bool {
        self.bulk
            .get()
            .and_then(Weak::upgrade)
            .is_some_and(|bulk| bulk.is_stopping())
    }

    /// Every `next` after `n` items have been produced fails.
    pub fn fail_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn next_calls(&self) -> u64 {
        self.state.lock().next_calls
    }

    pub fn next_after_stopping(&self) -> u64 {
        self.state.lock().next_after_stopping
    }

    pub fn produced(&self) -> u64 {
        self.state.lock().produced
    }

    pub fn executed(&self) -> Vec<Exec> {
        self.state.lock().executed.clone()
    }

    /// Items each worker pulled, in the order it pulled them.
    pub fn produced_per_worker(&self) -> BTreeMap<WorkerId, Vec<u64>> {
        let mut map: BTreeMap<WorkerId, Vec<u64>> = BTreeMap::new();
        for (worker, item) in &self.state.lock().produced_by {
            map.entry(*worker).or_default().push(*item);
        }
        map
    }

    /// Items each worker executed, in execution order.
    pub fn executed_per_worker(&self) -> BTreeMap<WorkerId, Vec<u64>> {
        let mut map: BTreeMap<WorkerId, Vec<u64>> = BTreeMap::new();
        for exec in &self.state.lock().executed {
            map.entry(exec.worker).or_default().push(exec.item);
        }
        map
    }
}

impl WorkSource<MemoryDomain> for ScriptedSource {
    type Item = u64;

    async fn next(&self, worker: WorkerId) -> txbulk::Result<Option<u64>> {
        let stopping = self.bulk_is_stopping();
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.next_calls += 1;
        if stopping {
            state.next_after_stopping += 1;
        }
        if self.panic_in_next_at == Some(state.produced) {
            let produced = state.produced;
            drop(state);
            panic!("injected panic in next after {produced} items");
        }
        if self.fail_after.is_some_and(|n| state.produced >= n) {
            return Err(Error::Source(format!(
                "injected failure after {} items",
                state.produced
            )));
        }
        if state.produced >= self.total {
            return Ok(None);
        }
        let item = state.produced;
        state.produced += 1;
        state.produced_by.push((worker, item));
        Ok(Some(item))
    }

    fn credit(&self, _item: &u64, accum: &mut Budget) {
        *accum += self.share;
    }

    async fn execute(&self, worker: WorkerId, tx: &mut MemoryTx, item: u64) {
        if self.panic_in_execute_at == Some(item) {
            panic!("injected panic on item {item}");
        }
        tokio::task::yield_now().await;
        tx.capture(self.share);
        self.state.lock().executed.push(Exec {
            worker,
            tx: tx.id(),
            item,
        });
    }
}

/// A small item share.
pub fn tiny_share() -> Budget {
    Budget::new(Credit::new(1, 64), 8)
}

/// A ceiling far above anything the tests pack.
pub fn roomy_limit() -> Budget {
    Budget::new(Credit::new(1 << 20, 1 << 30), 1 << 30)
}

/// Init and run a bulk, wait for its op and return it with the op.
pub async fn run_to_completion(
    domain: &Arc<MemoryDomain>,
    source: &Arc<ScriptedSource>,
    max_work_per_tx: u32,
    localities: Arc<dyn Localities>,
) -> (Arc<Bulk<ScriptedSource, MemoryDomain>>, Op) {
    let bulk = Bulk::init(
        BulkConfig::new(Arc::clone(domain), Arc::clone(source), max_work_per_tx),
        localities,
    )
    .expect("bulk init");
    source.watch(&bulk);
    let op = Op::new();
    bulk.run(&op).expect("bulk run");
    tokio::time::timeout(std::time::Duration::from_secs(30), op.wait())
        .await
        .expect("bulk did not complete");
    (bulk, op)
}
