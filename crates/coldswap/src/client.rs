//! Per-client command state: the outstanding-request counter and the flags
//! gating resumption.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::context::SwapError;
use crate::store::KeyspaceState;

/// Command body executed on the data plane once all swaps finished.
pub type PendingCommand = Box<dyn FnOnce(&mut KeyspaceState) + Send>;

/// A connected client as seen by the swap pipeline.
///
/// All counter/flag mutation happens on the data-plane thread; the atomics
/// exist because `SwapContext`s carry an `Arc<Client>` through the worker
/// threads and the type must be `Sync`.
pub struct Client {
    id: u64,
    replica_link: bool,
    outstanding: AtomicU64,
    swapping: AtomicBool,
    close_deferred: AtomicBool,
    processed: AtomicU64,
    repl_offset: AtomicU64,
    pending: Mutex<Option<PendingCommand>>,
    last_error: Mutex<Option<SwapError>>,
}

impl Client {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            replica_link: false,
            outstanding: AtomicU64::new(0),
            swapping: AtomicBool::new(false),
            close_deferred: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            repl_offset: AtomicU64::new(0),
            pending: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    /// A replication link; its key requests are derived at db level.
    pub fn replica(id: u64) -> Self {
        let mut client = Self::new(id);
        client.replica_link = true;
        client
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_replica_link(&self) -> bool {
        self.replica_link
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    pub fn is_swapping(&self) -> bool {
        self.swapping.load(Ordering::Acquire)
    }

    /// Mark the client for deferred close; it will never be resumed.
    pub fn defer_close(&self) {
        self.close_deferred.store(true, Ordering::Release);
    }

    pub fn is_close_deferred(&self) -> bool {
        self.close_deferred.load(Ordering::Acquire)
    }

    /// Commands processed for this client.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    /// Replication offset reached by the last resumed command.
    pub fn repl_offset(&self) -> u64 {
        self.repl_offset.load(Ordering::Acquire)
    }

    /// Error recorded by the most recent finished request, if any.
    pub fn take_swap_error(&self) -> Option<SwapError> {
        self.last_error.lock().ok().and_then(|mut guard| guard.take())
    }

    pub(crate) fn set_swap_error(&self, error: SwapError) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(error);
        }
    }

    pub(crate) fn begin_command(&self, command: PendingCommand) {
        if let Ok(mut guard) = self.pending.lock() {
            *guard = Some(command);
        }
        self.swapping.store(true, Ordering::Release);
    }

    /// Mark the client as swapping without parking a command; used when key
    /// requests are submitted outside the dispatch path.
    pub(crate) fn enter_swapping(&self) {
        self.swapping.store(true, Ordering::Release);
    }

    pub(crate) fn add_outstanding(&self, n: u64) {
        self.outstanding.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrement the outstanding counter; returns the remaining count.
    pub(crate) fn finish_one(&self) -> u64 {
        let previous = self.outstanding.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "finish without outstanding request");
        previous - 1
    }

    /// Clear the swapping flag; returns whether it was set, guarding
    /// against re-entrant resumption.
    pub(crate) fn end_swapping(&self) -> bool {
        self.swapping.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_pending(&self) -> Option<PendingCommand> {
        self.pending.lock().ok().and_then(|mut guard| guard.take())
    }

    pub(crate) fn mark_processed(&self) {
        self.processed.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_repl_offset(&self, offset: u64) {
        self.repl_offset.store(offset, Ordering::Release);
    }
}
