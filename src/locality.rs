//! Locality substrate: where bulk workers run.
//!
//! A locality is an execution context a worker is pinned to for its whole
//! life. The bulk asks the substrate how many localities there are (one
//! worker each) and hands every worker's task to its own locality.

use std::future::Future;
use std::pin::Pin;
use std::thread::JoinHandle;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// A worker task handed to a locality.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Enumerates localities and dispatches tasks onto them.
pub trait Localities: Send + Sync {
    /// Number of localities, i.e. number of bulk workers.
    fn nr(&self) -> usize;

    /// Run `task` on locality `index`.
    fn spawn(&self, index: usize, task: Task);
}

fn default_nr() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Runtime localities
// ---------------------------------------------------------------------------

/// Logical localities multiplexed on one tokio runtime.
pub struct RuntimeLocalities {
    handle: Handle,
    nr: usize,
}

impl RuntimeLocalities {
    pub fn new(handle: Handle, nr: usize) -> Self {
        Self { handle, nr }
    }

    /// One locality per available CPU on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Self::current_with(default_nr())
    }

    /// `nr` localities on the current runtime.
    pub fn current_with(nr: usize) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime for localities: {e}")))?;
        Ok(Self::new(handle, nr))
    }
}

impl Localities for RuntimeLocalities {
    fn nr(&self) -> usize {
        self.nr
    }

    fn spawn(&self, _index: usize, task: Task) {
        self.handle.spawn(task);
    }
}

// ---------------------------------------------------------------------------
// Thread localities
// ---------------------------------------------------------------------------

/// One OS thread per locality, each driving a current-thread runtime.
///
/// Tasks on the same locality never run in parallel with each other.
/// Dropping the pool stops accepting tasks, lets the running ones finish
/// and joins the threads.
pub struct ThreadLocalities {
    senders: Vec<mpsc::UnboundedSender<Task>>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadLocalities {
    /// Start `nr` locality threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for `nr == 0`, or an I/O error when a
    /// thread or its runtime cannot be started.
    pub fn new(nr: usize) -> Result<Self> {
        if nr == 0 {
            return Err(Error::Config("at least one locality thread is required".into()));
        }
        let mut senders = Vec::with_capacity(nr);
        let mut threads = Vec::with_capacity(nr);

        for index in 0..nr {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let (tx, rx) = mpsc::unbounded_channel();
            let thread = std::thread::Builder::new()
                .name(format!("txbulk-loc-{index}"))
                .spawn(move || runtime.block_on(locality_loop(index, rx)))?;
            senders.push(tx);
            threads.push(thread);
        }

        Ok(Self { senders, threads })
    }

    /// One locality thread per available CPU.
    pub fn with_default_nr() -> Result<Self> {
        Self::new(default_nr())
    }
}

async fn locality_loop(index: usize, mut rx: mpsc::UnboundedReceiver<Task>) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            task = rx.recv() => match task {
                Some(task) => {
                    tasks.spawn(task);
                }
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    warn!(locality = index, "locality task failed: {e}");
                }
            }
        }
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(locality = index, "locality task failed: {e}");
        }
    }
    debug!(locality = index, "locality stopped");
}

impl Localities for ThreadLocalities {
    fn nr(&self) -> usize {
        self.senders.len()
    }

    fn spawn(&self, index: usize, task: Task) {
        let sender = &self.senders[index % self.senders.len()];
        if sender.send(task).is_err() {
            warn!(locality = index, "locality is gone, task dropped");
        }
    }
}

impl Drop for ThreadLocalities {
    fn drop(&mut self) {
        self.senders.clear();
        let current = std::thread::current().id();
        for thread in self.threads.drain(..) {
            // The last owner may be a task running on one of our own threads.
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                warn!("locality thread panicked");
            }
        }
    }
}
