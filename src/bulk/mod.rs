//! Bulk coordinator.
//!
//! A [`Bulk`] owns one worker per locality. Each worker pulls items from the
//! [`WorkSource`], packs them into backend transactions and executes them,
//! until the source runs dry or the bulk is stopping. When the last worker
//! finishes, the aggregate [`Op`] passed to [`Bulk::run`] is signalled
//! exactly once and [`Bulk::status`] reports the outcome.
//!
//! Only the terminal result, the stop flag, the done counter and the op are
//! shared between workers; they sit behind one mutex that is never held
//! across an await.

mod packer;
mod worker;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{Instrument, debug, error, info, warn};

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::locality::Localities;
use crate::model::{BulkId, BulkReport, WorkerId, WorkerState, WorkerSummary};
use crate::op::Op;
use crate::source::WorkSource;
use crate::telemetry::bulk::{record_bulk_status, start_bulk_span, start_worker_span};
use crate::telemetry::metrics;

use worker::Worker;

/// User configuration of a bulk run. Immutable once handed to [`Bulk::init`].
pub struct BulkConfig<S, B> {
    /// Backend domain transactions are opened in.
    pub domain: Arc<B>,
    /// Producer and executor of work items, and the user datum.
    pub source: Arc<S>,
    /// Maximum number of `execute` calls in a single transaction.
    pub max_work_per_tx: u32,
}

impl<S, B> BulkConfig<S, B> {
    pub fn new(domain: Arc<B>, source: Arc<S>, max_work_per_tx: u32) -> Self {
        Self {
            domain,
            source,
            max_work_per_tx,
        }
    }
}

impl<S, B> Clone for BulkConfig<S, B> {
    fn clone(&self) -> Self {
        Self {
            domain: Arc::clone(&self.domain),
            source: Arc::clone(&self.source),
            max_work_per_tx: self.max_work_per_tx,
        }
    }
}

/// State shared by all workers of a bulk, guarded by `Bulk::shared`.
struct Shared {
    /// First fatal error. Never overwritten once set.
    rc: Option<Error>,
    done_nr: usize,
    started: bool,
    stopping: bool,
    done: bool,
    op: Option<Op>,
    workers: Vec<WorkerSummary>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    span: tracing::Span,
}

/// The bulk transaction executor.
pub struct Bulk<S, B> {
    id: BulkId,
    cfg: BulkConfig<S, B>,
    localities: Arc<dyn Localities>,
    worker_nr: usize,
    shared: Mutex<Shared>,
}

impl<S, B> Bulk<S, B>
where
    S: WorkSource<B>,
    B: Backend,
{
    /// Validate `cfg` and size the bulk to the locality substrate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `max_work_per_tx` is zero, the substrate
    /// has no localities, or the backend's transaction ceiling is zero.
    pub fn init(cfg: BulkConfig<S, B>, localities: Arc<dyn Localities>) -> Result<Arc<Self>> {
        if cfg.max_work_per_tx == 0 {
            return Err(Error::Config(
                "max_work_per_tx must be at least 1".to_string(),
            ));
        }
        let worker_nr = localities.nr();
        if worker_nr == 0 {
            return Err(Error::Config(
                "locality substrate reports no localities".to_string(),
            ));
        }
        if cfg.domain.tx_limit().is_zero() {
            return Err(Error::Config(
                "backend transaction limit is zero".to_string(),
            ));
        }

        let id = BulkId::new();
        debug!(
            bulk = %id,
            worker_nr,
            max_work_per_tx = cfg.max_work_per_tx,
            "bulk initialised"
        );

        Ok(Arc::new(Self {
            id,
            cfg,
            localities,
            worker_nr,
            shared: Mutex::new(Shared {
                rc: None,
                done_nr: 0,
                started: false,
                stopping: false,
                done: false,
                op: None,
                workers: Vec::new(),
                started_at: None,
                finished_at: None,
                span: tracing::Span::none(),
            }),
        }))
    }

    /// Start every worker on its locality and return immediately.
    ///
    /// `op` is signalled once all workers have finished, whether the work
    /// ran out or a fatal error stopped the run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the bulk was run before.
    pub fn run(self: &Arc<Self>, op: &Op) -> Result<()> {
        let span = start_bulk_span(&self.id, self.worker_nr);
        {
            let mut shared = self.shared.lock();
            if shared.started {
                return Err(Error::AlreadyStarted);
            }
            shared.started = true;
            shared.op = Some(op.clone());
            shared.started_at = Some(Utc::now());
            shared.workers = (0..self.worker_nr)
                .map(|i| WorkerSummary::new(WorkerId(i)))
                .collect();
            shared.span = span.clone();
        }

        span.in_scope(|| {
            info!(
                bulk = %self.id,
                workers = self.worker_nr,
                max_work_per_tx = self.cfg.max_work_per_tx,
                "bulk started"
            );
        });

        for index in 0..self.worker_nr {
            let id = WorkerId(index);
            let worker_span = start_worker_span(&span, id);
            let worker = Worker::new(Arc::clone(self), id, worker_span.clone());
            self.localities
                .spawn(index, Box::pin(worker.run().instrument(worker_span)));
        }
        Ok(())
    }

    /// Result of the run: `Ok(())` on success, otherwise the first fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InProgress`] if the run's op has not been signalled.
    pub fn status(&self) -> Result<()> {
        let shared = self.shared.lock();
        if !shared.done {
            return Err(Error::InProgress);
        }
        match &shared.rc {
            None => Ok(()),
            Some(e) => Err(e.clone()),
        }
    }

    /// Tear the bulk down and return what the run did.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InProgress`] if the run's op has not been signalled.
    pub fn fini(self: Arc<Self>) -> Result<BulkReport> {
        let mut shared = self.shared.lock();
        if !shared.done {
            return Err(Error::InProgress);
        }

        let workers = std::mem::take(&mut shared.workers);
        let now = Utc::now();
        let report = BulkReport {
            id: self.id,
            worker_nr: self.worker_nr,
            tx_nr: workers.iter().map(|w| w.tx_nr).sum(),
            item_nr: workers.iter().map(|w| w.item_nr).sum(),
            started_at: shared.started_at.unwrap_or(now),
            finished_at: shared.finished_at.unwrap_or(now),
            error: shared.rc.as_ref().map(|e| e.to_string()),
            workers,
        };
        shared.op = None;
        shared.span = tracing::Span::none();

        debug!(bulk = %self.id, "bulk finalised");
        Ok(report)
    }

    pub fn id(&self) -> BulkId {
        self.id
    }

    pub fn config(&self) -> &BulkConfig<S, B> {
        &self.cfg
    }

    /// Number of workers, one per locality.
    pub fn worker_nr(&self) -> usize {
        self.worker_nr
    }

    /// Workers that have reached [`WorkerState::Finished`].
    pub fn done_nr(&self) -> usize {
        self.shared.lock().done_nr
    }

    pub fn is_done(&self) -> bool {
        self.shared.lock().done
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.lock().stopping
    }

    /// Snapshot of per-worker summaries, as last published by the workers.
    pub fn workers(&self) -> Vec<WorkerSummary> {
        self.shared.lock().workers.clone()
    }

    /// Record a fatal error and make every worker stop pulling work.
    ///
    /// The first error wins; later ones are logged and dropped.
    fn fail(&self, worker: WorkerId, err: Error) {
        let mut shared = self.shared.lock();
        shared.stopping = true;
        match shared.rc {
            None => {
                error!(bulk = %self.id, %worker, error = %err, "bulk stopping");
                shared.rc = Some(err);
            }
            Some(ref first) => {
                warn!(
                    bulk = %self.id,
                    %worker,
                    error = %err,
                    first = %first,
                    "bulk already failed, error dropped"
                );
            }
        }
    }

    /// Called by each worker once, as its last action.
    fn worker_finished(&self, summary: WorkerSummary) {
        debug_assert!(summary.state.is_terminal());

        let mut shared = self.shared.lock();
        if shared.done_nr >= self.worker_nr {
            error!(
                bulk = %self.id,
                worker = %summary.worker,
                done_nr = shared.done_nr,
                worker_nr = self.worker_nr,
                "more workers finished than were started"
            );
            std::process::abort();
        }

        let index = summary.worker.0;
        shared.workers[index] = summary;
        shared.done_nr += 1;
        if shared.done_nr < self.worker_nr {
            return;
        }

        debug_assert!(
            shared
                .workers
                .iter()
                .all(|w| w.state == WorkerState::Finished)
        );
        shared.done = true;
        let now = Utc::now();
        shared.finished_at = Some(now);

        let status = if shared.rc.is_some() { "error" } else { "ok" };
        let tx_nr: u64 = shared.workers.iter().map(|w| w.tx_nr).sum();
        let item_nr: u64 = shared.workers.iter().map(|w| w.item_nr).sum();
        let duration_ms = shared
            .started_at
            .map(|t| (now - t).num_milliseconds().max(0) as f64)
            .unwrap_or(0.0);

        record_bulk_status(&shared.span, status);
        metrics::bulk_duration_ms().record(
            duration_ms,
            &[opentelemetry::KeyValue::new("result", status)],
        );
        info!(
            bulk = %self.id,
            tx_nr,
            item_nr,
            duration_ms,
            status,
            "bulk finished"
        );

        if let Some(op) = shared.op.as_ref() {
            op.signal();
        }
    }
}
