//! Background store iteration over a bounded ring buffer.
//!
//! A producer thread walks a [`StoreCursor`] and copies entries into a
//! fixed ring of slots; the consumer pulls them in order through a
//! pull-style [`StoreIterator`]. Entries up to the inline cache sizes are
//! copied without allocating; larger ones spill to an exact-size heap
//! buffer owned by the slot and handed to the consumer on pull.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::store::StoreCursor;

/// Inline key cache per slot; longer keys spill to the heap.
pub const KEY_CACHE_LEN: usize = 128;
/// Inline value cache per slot.
pub const VALUE_CACHE_LEN: usize = 4096;

struct Slot {
    key_len: usize,
    val_len: usize,
    key_cache: [u8; KEY_CACHE_LEN],
    val_cache: [u8; VALUE_CACHE_LEN],
    key_spill: Option<Box<[u8]>>,
    val_spill: Option<Box<[u8]>>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            key_len: 0,
            val_len: 0,
            key_cache: [0; KEY_CACHE_LEN],
            val_cache: [0; VALUE_CACHE_LEN],
            key_spill: None,
            val_spill: None,
        }
    }

    fn fill(&mut self, key: &[u8], value: &[u8]) {
        self.key_len = key.len();
        self.val_len = value.len();
        if key.len() <= KEY_CACHE_LEN {
            self.key_cache[..key.len()].copy_from_slice(key);
            self.key_spill = None;
        } else {
            self.key_spill = Some(key.to_vec().into_boxed_slice());
        }
        if value.len() <= VALUE_CACHE_LEN {
            self.val_cache[..value.len()].copy_from_slice(value);
            self.val_spill = None;
        } else {
            self.val_spill = Some(value.to_vec().into_boxed_slice());
        }
    }
}

struct RingState {
    slots: Vec<Slot>,
    /// Entries the producer has published. Monotone; never wraps a u64.
    produced: u64,
    /// Entries the consumer has retired. `produced - consumed` is the
    /// current occupancy and never exceeds capacity.
    consumed: u64,
    finished: bool,
    stop: bool,
    error: Option<anyhow::Error>,
}

struct RingShared {
    state: Mutex<RingState>,
    /// Signaled by the producer when an entry is published or the stream
    /// ends.
    ready: Condvar,
    /// Signaled by the consumer when a slot is retired and by `stop`.
    vacant: Condvar,
}

/// One staged entry on the consumer side.
///
/// Inline-sized entries are copied into the reusable buffers (capacity is
/// retained across pulls, so steady state does not allocate); spilled
/// buffers are moved out of the slot, making the spill a single allocation
/// freed exactly once.
pub struct StagedEntry {
    key_buf: Vec<u8>,
    val_buf: Vec<u8>,
    key_spill: Option<Box<[u8]>>,
    val_spill: Option<Box<[u8]>>,
}

impl StagedEntry {
    pub fn new() -> Self {
        Self {
            key_buf: Vec::with_capacity(KEY_CACHE_LEN),
            val_buf: Vec::with_capacity(VALUE_CACHE_LEN),
            key_spill: None,
            val_spill: None,
        }
    }

    pub fn key(&self) -> &[u8] {
        match &self.key_spill {
            Some(spill) => spill,
            None => &self.key_buf,
        }
    }

    pub fn value(&self) -> &[u8] {
        match &self.val_spill {
            Some(spill) => spill,
            None => &self.val_buf,
        }
    }
}

impl Default for StagedEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle on the ring; producer and consumer each hold a clone.
#[derive(Clone)]
pub struct BufferedQueue {
    shared: Arc<RingShared>,
    capacity: usize,
}

impl BufferedQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        let slots = (0..capacity).map(|_| Slot::empty()).collect();
        Self {
            shared: Arc::new(RingShared {
                state: Mutex::new(RingState {
                    slots,
                    produced: 0,
                    consumed: 0,
                    finished: false,
                    stop: false,
                    error: None,
                }),
                ready: Condvar::new(),
                vacant: Condvar::new(),
            }),
            capacity,
        }
    }

    /// Producer: block until at least one slot is vacant. Returns the
    /// number of vacant slots, or `None` when stop was requested.
    pub fn wait_vacant(&self) -> Option<usize> {
        let mut state = self.shared.state.lock().ok()?;
        loop {
            if state.stop {
                return None;
            }
            let occupied = (state.produced - state.consumed) as usize;
            if occupied < self.capacity {
                return Some(self.capacity - occupied);
            }
            state = self.shared.vacant.wait(state).ok()?;
        }
    }

    /// Producer: publish one entry. Returns false when the consumer asked
    /// to stop or the ring is full (callers gate on `wait_vacant`).
    pub fn push(&self, key: &[u8], value: &[u8]) -> bool {
        let Ok(mut state) = self.shared.state.lock() else {
            return false;
        };
        if state.stop {
            return false;
        }
        let occupied = (state.produced - state.consumed) as usize;
        if occupied == self.capacity {
            return false;
        }
        let index = (state.produced % self.capacity as u64) as usize;
        state.slots[index].fill(key, value);
        state.produced += 1;
        drop(state);
        self.shared.ready.notify_one();
        true
    }

    /// Producer: mark the stream complete, carrying a cursor error if the
    /// walk ended early.
    pub fn finish(&self, error: Option<anyhow::Error>) {
        if let Ok(mut state) = self.shared.state.lock() {
            if !state.finished {
                state.finished = true;
                state.error = error;
            }
        }
        self.shared.ready.notify_all();
    }

    /// Consumer: stage the next entry, blocking while the ring is empty and
    /// the producer is still running. Returns false once the stream is
    /// finished and drained.
    pub fn pull(&self, stage: &mut StagedEntry) -> bool {
        let Ok(mut state) = self.shared.state.lock() else {
            return false;
        };
        loop {
            if state.consumed < state.produced {
                break;
            }
            if state.finished {
                return false;
            }
            state = match self.shared.ready.wait(state) {
                Ok(state) => state,
                Err(_) => return false,
            };
        }
        let index = (state.consumed % self.capacity as u64) as usize;
        let slot = &mut state.slots[index];
        stage.key_spill = slot.key_spill.take();
        stage.val_spill = slot.val_spill.take();
        if stage.key_spill.is_none() {
            stage.key_buf.clear();
            stage.key_buf.extend_from_slice(&slot.key_cache[..slot.key_len]);
        }
        if stage.val_spill.is_none() {
            stage.val_buf.clear();
            stage.val_buf.extend_from_slice(&slot.val_cache[..slot.val_len]);
        }
        true
    }

    /// Consumer: retire the staged entry, opening its slot for reuse.
    pub fn mark_consumed(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            debug_assert!(state.consumed < state.produced, "consume past produced");
            state.consumed += 1;
        }
        self.shared.vacant.notify_one();
    }

    /// Consumer: ask the producer to wind down at its next wait point.
    pub fn stop(&self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.stop = true;
        }
        self.shared.vacant.notify_all();
        self.shared.ready.notify_all();
    }

    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.shared.state.lock().ok().and_then(|mut state| state.error.take())
    }

    /// Entries currently buffered.
    pub fn occupancy(&self) -> usize {
        self.shared
            .state
            .lock()
            .map(|state| (state.produced - state.consumed) as usize)
            .unwrap_or(0)
    }

    pub fn is_finished(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|state| state.finished)
            .unwrap_or(true)
    }
}

/// Pull-style iterator over a background store walk.
///
/// The cursor is built and lives on the producer thread for its whole life,
/// so its disk reads never block the caller and the cursor type itself does
/// not need to be `Send`; the caller sees only ring pulls.
pub struct StoreIterator {
    queue: BufferedQueue,
    handle: Option<JoinHandle<()>>,
    stage: StagedEntry,
    ready: bool,
}

impl StoreIterator {
    /// Start the producer thread with a ring of `capacity` slots.
    ///
    /// `make_cursor` runs on the producer thread; only the factory crosses
    /// the thread boundary, never the cursor.
    pub fn spawn<F>(make_cursor: F, capacity: usize) -> anyhow::Result<Self>
    where
        F: FnOnce() -> Box<dyn StoreCursor> + Send + 'static,
    {
        anyhow::ensure!(capacity > 0, "iterator buffer capacity must be positive");
        let queue = BufferedQueue::new(capacity);
        let producer = queue.clone();
        let handle = thread::Builder::new()
            .name("store-iter".to_string())
            .spawn(move || producer_loop(make_cursor(), producer))
            .map_err(|err| anyhow::anyhow!("failed to spawn store iterator thread: {err}"))?;
        Ok(Self {
            queue,
            handle: Some(handle),
            stage: StagedEntry::new(),
            ready: false,
        })
    }

    /// Position on the first entry. Returns false for an empty store.
    pub fn seek_to_first(&mut self) -> bool {
        self.ready = self.queue.pull(&mut self.stage);
        self.ready
    }

    /// The entry under the iterator, valid until the next `advance`.
    pub fn current(&self) -> Option<(&[u8], &[u8])> {
        if !self.ready {
            return None;
        }
        Some((self.stage.key(), self.stage.value()))
    }

    /// Retire the current entry and move to the next one.
    pub fn advance(&mut self) -> bool {
        if !self.ready {
            return false;
        }
        self.queue.mark_consumed();
        self.ready = self.queue.pull(&mut self.stage);
        self.ready
    }

    /// Cursor error, if the background walk ended early. Only meaningful
    /// once iteration has returned false.
    pub fn take_error(&self) -> Option<anyhow::Error> {
        self.queue.take_error()
    }

    /// Entries buffered ahead of the consumer.
    pub fn buffered(&self) -> usize {
        self.queue.occupancy()
    }

    /// Stop the producer and join it. The cursor is dropped on the
    /// producer thread as it exits.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        self.queue.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("store iterator thread panicked");
            }
        }
    }
}

impl Drop for StoreIterator {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn producer_loop(mut cursor: Box<dyn StoreCursor>, queue: BufferedQueue) {
    loop {
        if !cursor.valid() {
            queue.finish(cursor.take_error());
            return;
        }
        let Some(vacant) = queue.wait_vacant() else {
            // Stop requested; the stream ends without a terminal marker.
            return;
        };
        // Fill the vacancy we saw in one burst, then go back to waiting.
        for _ in 0..vacant {
            if !cursor.valid() {
                break;
            }
            if !queue.push(cursor.key(), cursor.value()) {
                return;
            }
            cursor.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}

    #[test]
    fn queue_handles_are_send() {
        assert_send::<BufferedQueue>();
    }

    #[test]
    fn push_pull_preserves_order() {
        let queue = BufferedQueue::new(4);
        assert!(queue.push(b"a", b"1"));
        assert!(queue.push(b"b", b"2"));
        let mut stage = StagedEntry::new();
        assert!(queue.pull(&mut stage));
        assert_eq!(stage.key(), b"a");
        assert_eq!(stage.value(), b"1");
        queue.mark_consumed();
        assert!(queue.pull(&mut stage));
        assert_eq!(stage.key(), b"b");
        queue.mark_consumed();
        assert_eq!(queue.occupancy(), 0);
    }

    #[test]
    fn push_rejects_when_full() {
        let queue = BufferedQueue::new(2);
        assert!(queue.push(b"a", b"1"));
        assert!(queue.push(b"b", b"2"));
        assert!(!queue.push(b"c", b"3"));
        let mut stage = StagedEntry::new();
        assert!(queue.pull(&mut stage));
        queue.mark_consumed();
        assert!(queue.push(b"c", b"3"));
    }

    #[test]
    fn wraparound_reuses_slots() {
        let queue = BufferedQueue::new(2);
        let mut stage = StagedEntry::new();
        for round in 0u8..5 {
            let key = [b'k', round];
            assert!(queue.push(&key, &[round]));
            assert!(queue.pull(&mut stage));
            assert_eq!(stage.key(), &key);
            assert_eq!(stage.value(), &[round]);
            queue.mark_consumed();
        }
    }

    #[test]
    fn oversized_entries_spill_and_move_out() {
        let queue = BufferedQueue::new(2);
        let big_key = vec![7u8; KEY_CACHE_LEN + 1];
        let big_val = vec![9u8; VALUE_CACHE_LEN + 100];
        assert!(queue.push(&big_key, &big_val));
        let mut stage = StagedEntry::new();
        assert!(queue.pull(&mut stage));
        assert!(stage.key_spill.is_some());
        assert!(stage.val_spill.is_some());
        assert_eq!(stage.key(), &big_key[..]);
        assert_eq!(stage.value(), &big_val[..]);
        queue.mark_consumed();
        // The slot gave up its spill; the next inline entry must not see it.
        assert!(queue.push(b"small", b"v"));
        assert!(queue.pull(&mut stage));
        assert!(stage.key_spill.is_none());
        assert_eq!(stage.key(), b"small");
        queue.mark_consumed();
    }

    #[test]
    fn finish_wakes_empty_pull() {
        let queue = BufferedQueue::new(2);
        queue.finish(None);
        let mut stage = StagedEntry::new();
        assert!(!queue.pull(&mut stage));
        assert!(queue.is_finished());
    }

    #[test]
    fn finish_error_surfaces_once() {
        let queue = BufferedQueue::new(2);
        queue.finish(Some(anyhow::anyhow!("cursor failed")));
        assert!(queue.take_error().is_some());
        assert!(queue.take_error().is_none());
    }

    #[test]
    fn stop_unblocks_producer_wait() {
        let queue = BufferedQueue::new(1);
        assert!(queue.push(b"a", b"1"));
        let producer = queue.clone();
        let handle = std::thread::spawn(move || producer.wait_vacant());
        queue.stop();
        assert!(handle.join().unwrap().is_none());
    }
}
