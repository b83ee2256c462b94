//! Swap-worker pool: performs the disk half of every async swap.
//!
//! Workers pull submitted contexts off a shared channel, run the decided
//! disk operation against the cold store, and hand the finished context back
//! to the data plane over the completion channel. A worker never invokes the
//! finished callback itself; that happens in the data plane's drain, which
//! is what keeps all keyspace mutation single-threaded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::Context as _;
use tracing::warn;

use crate::context::{SwapContext, SwapError};
use crate::request::SwapIntention;
use crate::store::ColdStore;
use crate::trace::TraceSink;

/// Snapshot of swap-worker counters for logging/monitoring.
#[derive(Default, Debug, Clone, Copy)]
pub struct WorkerStatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub get_ops: u64,
    pub put_ops: u64,
    pub del_ops: u64,
    pub io_errors: u64,
}

/// Internal counters used to build `WorkerStatsSnapshot`.
struct WorkerStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    get_ops: AtomicU64,
    put_ops: AtomicU64,
    del_ops: AtomicU64,
    io_errors: AtomicU64,
}

impl WorkerStats {
    const fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            get_ops: AtomicU64::new(0),
            put_ops: AtomicU64::new(0),
            del_ops: AtomicU64::new(0),
            io_errors: AtomicU64::new(0),
        }
    }

    fn record_op(&self, intention: SwapIntention) {
        match intention {
            SwapIntention::Get => self.get_ops.fetch_add(1, Ordering::Relaxed),
            SwapIntention::Put => self.put_ops.fetch_add(1, Ordering::Relaxed),
            SwapIntention::Del => self.del_ops.fetch_add(1, Ordering::Relaxed),
            SwapIntention::Nop => 0,
        };
    }

    fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            get_ops: self.get_ops.load(Ordering::Relaxed),
            put_ops: self.put_ops.load(Ordering::Relaxed),
            del_ops: self.del_ops.load(Ordering::Relaxed),
            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

/// Pool of swap-worker threads.
///
/// Submission takes ownership of the context; exactly one completion is
/// delivered per submitted context, with the outcome encoded in the context
/// itself rather than in any return value.
pub struct SwapWorkerPool {
    tx: Option<mpsc::Sender<SwapContext>>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl SwapWorkerPool {
    /// Spawn `threads` workers draining a shared submission channel.
    pub fn spawn(
        store: ColdStore,
        threads: usize,
        completion_tx: mpsc::Sender<SwapContext>,
        trace: Arc<dyn TraceSink>,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel::<SwapContext>();
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(WorkerStats::new());

        let mut handles = Vec::with_capacity(threads.max(1));
        for i in 0..threads.max(1) {
            let rx = Arc::clone(&rx);
            let store = store.clone();
            let completion_tx = completion_tx.clone();
            let stats = Arc::clone(&stats);
            let trace = Arc::clone(&trace);
            let handle = thread::Builder::new()
                .name(format!("swap-worker-{i}"))
                .spawn(move || worker_loop(&rx, &store, &completion_tx, &stats, trace.as_ref()))
                .context("spawn swap worker thread")?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            handles,
            stats,
        })
    }

    /// Submit a context for async execution. On a closed pool the context is
    /// returned so the caller can complete it locally.
    pub(crate) fn submit(&self, ctx: SwapContext) -> Result<(), SwapContext> {
        let Some(tx) = &self.tx else {
            return Err(ctx);
        };
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        tx.send(ctx).map_err(|err| err.0)
    }

    pub fn stats_snapshot(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close the submission channel and join every worker. In-flight jobs
    /// still deliver their completions before the threads exit.
    pub fn shutdown(&mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SwapWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: &Mutex<mpsc::Receiver<SwapContext>>,
    store: &ColdStore,
    completion_tx: &mpsc::Sender<SwapContext>,
    stats: &WorkerStats,
    trace: &dyn TraceSink,
) {
    loop {
        let mut ctx = {
            let Ok(guard) = rx.lock() else {
                return;
            };
            match guard.recv() {
                Ok(ctx) => ctx,
                Err(_) => return,
            }
        };

        let intention = ctx.intention();
        let outcome = match ctx.data() {
            Some(data) => data.execute(intention, store),
            None => Ok(None),
        };
        match outcome {
            Ok(result) => {
                stats.record_op(intention);
                ctx.set_result(result);
                trace.append(&ctx.trace_label(), "worker done");
            }
            Err(err) => {
                warn!(error = ?err, "swap worker disk operation failed");
                stats.io_errors.fetch_add(1, Ordering::Relaxed);
                ctx.set_error(SwapError::Io);
                trace.append(&ctx.trace_label(), "worker io error");
            }
        }
        stats.completed.fetch_add(1, Ordering::Relaxed);

        // Data plane gone; nothing left to complete into.
        if completion_tx.send(ctx).is_err() {
            return;
        }
    }
}
