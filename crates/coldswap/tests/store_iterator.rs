//! Integration tests for the background store iterator: ordering,
//! backpressure, error reporting, and producer-thread lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use coldswap::store::{ColdStore, StoreCursor};
use coldswap::value::Value;
use coldswap::StoreIterator;

/// In-memory cursor double; flags its drop so tests can prove the producer
/// thread was joined and released it.
struct VecCursor {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
    fail_after: Option<usize>,
    error: Option<anyhow::Error>,
    dropped: Arc<AtomicBool>,
}

impl VecCursor {
    fn new(entries: Vec<(Vec<u8>, Vec<u8>)>) -> (Self, Arc<AtomicBool>) {
        let dropped = Arc::new(AtomicBool::new(false));
        let cursor = Self {
            entries,
            pos: 0,
            fail_after: None,
            error: None,
            dropped: Arc::clone(&dropped),
        };
        (cursor, dropped)
    }

    fn failing_after(entries: Vec<(Vec<u8>, Vec<u8>)>, after: usize) -> Self {
        let (mut cursor, _) = Self::new(entries);
        cursor.fail_after = Some(after);
        cursor
    }
}

impl StoreCursor for VecCursor {
    fn valid(&self) -> bool {
        self.error.is_none() && self.pos < self.entries.len()
    }

    fn key(&self) -> &[u8] {
        self.entries.get(self.pos).map_or(&[], |(k, _)| k)
    }

    fn value(&self) -> &[u8] {
        self.entries.get(self.pos).map_or(&[], |(_, v)| v)
    }

    fn advance(&mut self) {
        self.pos += 1;
        if self.fail_after == Some(self.pos) {
            self.error = Some(anyhow::anyhow!("simulated scan failure"));
        }
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }
}

impl Drop for VecCursor {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

fn entries(n: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..n)
        .map(|i| {
            (
                format!("k{i:04}").into_bytes(),
                format!("v{i:04}").into_bytes(),
            )
        })
        .collect()
}

fn spawn_over(cursor: VecCursor, capacity: usize) -> StoreIterator {
    StoreIterator::spawn(move || Box::new(cursor) as Box<dyn StoreCursor>, capacity)
        .expect("spawn")
}

fn collect_all(iter: &mut StoreIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut more = iter.seek_to_first();
    while more {
        let (key, value) = iter.current().expect("current after positive pull");
        out.push((key.to_vec(), value.to_vec()));
        more = iter.advance();
    }
    out
}

#[test]
fn empty_store_yields_nothing() {
    let (cursor, _) = VecCursor::new(Vec::new());
    let mut iter = spawn_over(cursor, 4);
    assert!(!iter.seek_to_first());
    assert!(iter.current().is_none());
    assert!(iter.take_error().is_none());
}

#[test]
fn yields_every_entry_in_order() {
    // One below, at, and above the ring capacity, forcing wraparound.
    for n in [1usize, 4, 9] {
        let expected = entries(n);
        let (cursor, _) = VecCursor::new(expected.clone());
        let mut iter = spawn_over(cursor, 4);
        assert_eq!(collect_all(&mut iter), expected);
        assert!(iter.take_error().is_none());
    }
}

#[test]
fn buffering_never_exceeds_capacity() {
    let capacity = 4;
    let (cursor, _) = VecCursor::new(entries(64));
    let mut iter = spawn_over(cursor, capacity);
    assert!(iter.seek_to_first());

    // Paused consumer: give the producer time to fill, then check it
    // stopped at the ring bound.
    thread::sleep(Duration::from_millis(100));
    assert!(iter.buffered() <= capacity);

    let mut remaining = Vec::new();
    remaining.push(iter.current().expect("current").0.to_vec());
    while iter.advance() {
        remaining.push(iter.current().expect("current").0.to_vec());
        assert!(iter.buffered() <= capacity);
    }
    assert_eq!(remaining.len(), 64);
}

#[test]
fn scan_failure_surfaces_after_the_last_good_entry() {
    let cursor = VecCursor::failing_after(entries(10), 3);
    let mut iter = spawn_over(cursor, 4);
    let got = collect_all(&mut iter);
    assert_eq!(got.len(), 3);
    let err = iter.take_error().expect("scan error");
    assert!(err.to_string().contains("simulated scan failure"));
    // Taken once.
    assert!(iter.take_error().is_none());
}

#[test]
fn release_joins_the_producer_and_drops_the_cursor() {
    let (cursor, dropped) = VecCursor::new(entries(32));
    let mut iter = spawn_over(cursor, 2);
    assert!(iter.seek_to_first());
    // Stop mid-stream; release must not hang on the blocked producer.
    iter.release();
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn drop_joins_the_producer() {
    let (cursor, dropped) = VecCursor::new(entries(32));
    {
        let mut iter = spawn_over(cursor, 2);
        assert!(iter.seek_to_first());
    }
    assert!(dropped.load(Ordering::SeqCst));
}

#[test]
fn oversized_values_come_through_intact() {
    let big = vec![0xabu8; 16 * 1024];
    let rows = vec![
        (b"big".to_vec(), big.clone()),
        (b"small".to_vec(), b"v".to_vec()),
    ];
    let (cursor, _) = VecCursor::new(rows.clone());
    let mut iter = spawn_over(cursor, 2);
    assert_eq!(collect_all(&mut iter), rows);
}

#[test]
fn walks_a_real_store_partition() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = ColdStore::open(dir.path()).expect("open store");
    let mut expected = Vec::new();
    for i in 0..20 {
        let key = format!("row{i:02}").into_bytes();
        store
            .flush(&key, &Value::raw(format!("val{i:02}").into_bytes()))
            .expect("flush");
        expected.push(key);
    }

    // The fjall range is not Send; only the cloned store handle crosses
    // into the producer thread, which opens the cursor itself.
    let walker = store.clone();
    let mut iter = StoreIterator::spawn(
        move || Box::new(walker.cursor()) as Box<dyn StoreCursor>,
        4,
    )
    .expect("spawn");
    let keys: Vec<Vec<u8>> = collect_all(&mut iter).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, expected);
    assert!(iter.take_error().is_none());
}

#[test]
fn cursor_is_built_on_the_producer_thread() {
    let built_on = Arc::new(Mutex::new(None::<String>));
    let sink = Arc::clone(&built_on);
    let (cursor, _) = VecCursor::new(entries(3));
    let mut iter = StoreIterator::spawn(
        move || {
            *sink.lock().unwrap() = thread::current().name().map(str::to_string);
            Box::new(cursor) as Box<dyn StoreCursor>
        },
        4,
    )
    .expect("spawn");
    assert_eq!(collect_all(&mut iter).len(), 3);
    assert_eq!(built_on.lock().unwrap().as_deref(), Some("store-iter"));
}
