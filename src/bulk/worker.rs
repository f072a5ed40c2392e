//! Bulk worker state machine.
//!
//! One worker per locality, holding at most one open transaction at a time.
//! Each [`Step`] does its action and returns the next step; the only awaits
//! are on the source (`next`, `execute`) and the backend (`open`, `close`).
//!
//! | step           | action                                   | next                          |
//! |----------------|------------------------------------------|-------------------------------|
//! | Idle           | stop if stopping, else start a new pack   | NeedItem / Finished           |
//! | NeedItem       | pushback item, else `next`                | GotItem / OpenTx / Drained / Finished |
//! | GotItem        | `credit`, offer to the packer             | NeedItem / OpenTx             |
//! | OpenTx         | open sized to the pack                   | DoItems / CloseOnFailure      |
//! | DoItems        | `execute` each packed item in order      | CloseTx                       |
//! | CloseTx        | close                                    | Idle / Drained                |
//! | Drained        | mark drained                             | Finished                      |
//! | CloseOnFailure | drop packed items                        | Finished                      |
//!
//! Once the bulk is stopping a worker never calls `next` again. Items it
//! already pulled are still flushed in one last transaction, unless that
//! worker's own open failed.
//!
//! A panic in the source or the backend stops the bulk like any other
//! failure: the worker records it, drops what it packed and still reports
//! itself finished, so the bulk op fires. A panic inside `execute` closes
//! the open transaction first.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use opentelemetry::KeyValue;
use tracing::{Span, debug, error, trace, warn};

use super::Bulk;
use super::packer::{Offer, Packer};
use crate::backend::Backend;
use crate::credit::Budget;
use crate::error::Error;
use crate::model::{WorkerId, WorkerState, WorkerSummary};
use crate::source::WorkSource;
use crate::telemetry::bulk::record_state_transition;
use crate::telemetry::metrics::BulkInstruments;

/// One step of the worker state machine.
enum Step<I, T> {
    Idle,
    NeedItem,
    GotItem(I),
    OpenTx,
    DoItems(T),
    CloseTx(T),
    Drained,
    CloseOnFailure,
    Finished,
}

impl<I, T> Step<I, T> {
    fn state(&self) -> WorkerState {
        match self {
            Step::Idle => WorkerState::Idle,
            Step::NeedItem => WorkerState::NeedItem,
            Step::GotItem(_) => WorkerState::GotItem,
            Step::OpenTx => WorkerState::OpenTx,
            Step::DoItems(_) => WorkerState::DoItems,
            Step::CloseTx(_) => WorkerState::CloseTx,
            Step::Drained => WorkerState::Drained,
            Step::CloseOnFailure => WorkerState::CloseOnFailure,
            Step::Finished => WorkerState::Finished,
        }
    }
}

pub(super) struct Worker<S, B>
where
    S: WorkSource<B>,
    B: Backend,
{
    bulk: Arc<Bulk<S, B>>,
    id: WorkerId,
    packer: Packer<S::Item>,
    /// The source reported no more work; finish after flushing.
    exhausted: bool,
    summary: WorkerSummary,
    span: Span,
    instruments: BulkInstruments,
    labels: [KeyValue; 1],
}

impl<S, B> Worker<S, B>
where
    S: WorkSource<B>,
    B: Backend,
{
    pub(super) fn new(bulk: Arc<Bulk<S, B>>, id: WorkerId, span: Span) -> Self {
        let max_work = bulk.cfg.max_work_per_tx as usize;
        let limit = bulk.cfg.domain.tx_limit();
        Self {
            bulk,
            id,
            packer: Packer::new(max_work, limit),
            exhausted: false,
            summary: WorkerSummary::new(id),
            span,
            instruments: BulkInstruments::new(),
            labels: [KeyValue::new("worker", id.0 as i64)],
        }
    }

    /// Drive the state machine to [`WorkerState::Finished`] and report back.
    pub(super) async fn run(mut self) {
        if let Err(panic) = AssertUnwindSafe(self.drive()).catch_unwind().await {
            self.panicked(panic_message(&*panic));
        }

        self.summary.state = WorkerState::Finished;
        self.span.record("worker.tx_nr", self.summary.tx_nr);
        debug!(
            worker = %self.id,
            tx_nr = self.summary.tx_nr,
            item_nr = self.summary.item_nr,
            drained = self.summary.drained,
            "worker finished"
        );
        self.bulk.worker_finished(self.summary.clone());
    }

    async fn drive(&mut self) {
        let mut step: Step<S::Item, B::Tx> = Step::Idle;
        loop {
            let from = step.state();
            step = self.step(step).await;
            let to = step.state();

            debug_assert!(
                from.can_transition_to(to),
                "invalid worker transition {from} -> {to}"
            );
            record_state_transition(&self.span, from.as_str(), to.as_str());

            if to.is_terminal() {
                break;
            }
        }
    }

    /// Stop the bulk after a panic in this worker and drop its packed items.
    fn panicked(&mut self, message: String) {
        error!(worker = %self.id, "worker panicked: {message}");
        self.bulk.fail(
            self.id,
            Error::Other(format!("worker {} panicked: {message}", self.id)),
        );
        let dropped = self.packer.discard();
        if dropped > 0 {
            warn!(worker = %self.id, dropped, "packed items dropped after panic");
        }
    }

    async fn step(&mut self, step: Step<S::Item, B::Tx>) -> Step<S::Item, B::Tx> {
        match step {
            Step::Idle => self.idle(),
            Step::NeedItem => self.need_item().await,
            Step::GotItem(item) => self.got_item(item),
            Step::OpenTx => self.open_tx().await,
            Step::DoItems(tx) => self.do_items(tx).await,
            Step::CloseTx(tx) => self.close_tx(tx).await,
            Step::Drained => {
                self.summary.drained = true;
                Step::Finished
            }
            Step::CloseOnFailure => {
                let dropped = self.packer.discard();
                if dropped > 0 {
                    warn!(worker = %self.id, dropped, "packed items dropped after failed open");
                }
                Step::Finished
            }
            Step::Finished => Step::Finished,
        }
    }

    fn idle(&mut self) -> Step<S::Item, B::Tx> {
        if self.bulk.is_stopping() && !self.packer.has_pushback() {
            return Step::Finished;
        }
        self.packer.reset();
        Step::NeedItem
    }

    async fn need_item(&mut self) -> Step<S::Item, B::Tx> {
        if let Some(item) = self.packer.take_pushback() {
            return Step::GotItem(item);
        }
        if self.bulk.is_stopping() {
            return self.flush_or(Step::Finished);
        }

        self.summary.next_nr += 1;
        match self.bulk.cfg.source.next(self.id).await {
            Ok(Some(item)) => Step::GotItem(item),
            Ok(None) => {
                trace!(worker = %self.id, "source exhausted");
                self.exhausted = true;
                self.flush_or(Step::Drained)
            }
            Err(e) => {
                self.instruments.source_errors.add(1, &self.labels);
                self.bulk.fail(self.id, e);
                self.flush_or(Step::Finished)
            }
        }
    }

    /// Open a transaction for whatever is packed, or go to `otherwise`.
    fn flush_or(&self, otherwise: Step<S::Item, B::Tx>) -> Step<S::Item, B::Tx> {
        if self.packer.is_empty() {
            otherwise
        } else {
            Step::OpenTx
        }
    }

    fn got_item(&mut self, item: S::Item) -> Step<S::Item, B::Tx> {
        let mut share = Budget::ZERO;
        self.bulk.cfg.source.credit(&item, &mut share);
        match self.packer.offer(item, share) {
            Offer::Packed => Step::NeedItem,
            Offer::Full | Offer::Boundary => Step::OpenTx,
        }
    }

    async fn open_tx(&mut self) -> Step<S::Item, B::Tx> {
        let budget = self.packer.budget();
        match self.bulk.cfg.domain.open(budget).await {
            Ok(tx) => {
                self.instruments.tx_opened.add(1, &self.labels);
                trace!(worker = %self.id, %budget, items = self.packer.len(), "tx opened");
                Step::DoItems(tx)
            }
            Err(e) => {
                self.instruments.tx_open_failures.add(1, &self.labels);
                self.bulk.fail(self.id, e);
                Step::CloseOnFailure
            }
        }
    }

    async fn do_items(&mut self, mut tx: B::Tx) -> Step<S::Item, B::Tx> {
        let source = &self.bulk.cfg.source;
        let mut done = 0u64;
        let mut panic = None;
        for item in self.packer.drain() {
            let executed = AssertUnwindSafe(source.execute(self.id, &mut tx, item))
                .catch_unwind()
                .await;
            if let Err(payload) = executed {
                panic = Some(panic_message(&*payload));
                break;
            }
            done += 1;
        }

        self.summary.item_nr += done;
        self.instruments.items_executed.add(done, &self.labels);
        self.instruments.tx_items.record(done, &self.labels);
        if let Some(message) = panic {
            self.panicked(message);
        }
        Step::CloseTx(tx)
    }

    async fn close_tx(&mut self, tx: B::Tx) -> Step<S::Item, B::Tx> {
        self.bulk.cfg.domain.close(tx).await;
        self.summary.tx_nr += 1;
        if self.exhausted {
            Step::Drained
        } else {
            Step::Idle
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
