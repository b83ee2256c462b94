//! The two halves of the hybrid keyspace: the in-memory table owned by the
//! data plane and the fjall-backed persistent store the swap workers talk to.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions};

use crate::value::{decode_value, encode_value, Value};

/// Partition holding encoded cold values.
const DATA_PARTITION: &str = "cold_data";
/// Partition acting as the cold-key index (presence only, empty values).
const META_PARTITION: &str = "cold_meta";

/// In-memory side of a hybrid keyspace.
///
/// Owned exclusively by the data-plane thread; swap workers never see it.
/// The cold set mirrors the persistent store's `cold_meta` partition so that
/// swap decisions never touch disk.
#[derive(Default)]
pub struct KeyspaceState {
    mem: HashMap<Vec<u8>, Value>,
    cold: HashSet<Vec<u8>>,
}

impl KeyspaceState {
    pub fn new(cold: HashSet<Vec<u8>>) -> Self {
        Self {
            mem: HashMap::new(),
            cold,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.mem.get(key)
    }

    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: Value) {
        self.mem.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<Value> {
        self.mem.remove(key)
    }

    /// Whether the key currently has an on-disk copy.
    pub fn is_cold(&self, key: &[u8]) -> bool {
        self.cold.contains(key)
    }

    pub fn mark_cold(&mut self, key: impl Into<Vec<u8>>) {
        self.cold.insert(key.into());
    }

    pub fn clear_cold(&mut self, key: &[u8]) {
        self.cold.remove(key);
    }

    pub fn resident_len(&self) -> usize {
        self.mem.len()
    }

    pub fn cold_len(&self) -> usize {
        self.cold.len()
    }
}

/// Handle to the persistent store.
///
/// Cheap to clone; each swap worker owns a clone and performs its disk I/O
/// through it. The data plane itself never reads or writes values here.
#[derive(Clone)]
pub struct ColdStore {
    keyspace: Arc<Keyspace>,
    data: fjall::PartitionHandle,
    meta: fjall::PartitionHandle,
}

impl ColdStore {
    /// Open or create the persistent store under `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open cold store keyspace")?;
        let keyspace = Arc::new(keyspace);
        let data = keyspace
            .open_partition(DATA_PARTITION, PartitionCreateOptions::default())
            .context("open cold data partition")?;
        let meta = keyspace
            .open_partition(META_PARTITION, PartitionCreateOptions::default())
            .context("open cold meta partition")?;
        Ok(Self {
            keyspace,
            data,
            meta,
        })
    }

    /// Load the full cold-key index, used to seed the in-memory mirror.
    pub fn load_cold_index(&self) -> anyhow::Result<HashSet<Vec<u8>>> {
        let mut index = HashSet::new();
        for item in self.meta.range(Vec::<u8>::new()..) {
            let (key, _) = item.context("scan cold meta partition")?;
            index.insert(key.as_ref().to_vec());
        }
        Ok(index)
    }

    /// Read and decode a cold value. Worker-side.
    pub fn fetch(&self, key: &[u8]) -> anyhow::Result<Option<Value>> {
        let Some(bytes) = self.data.get(key).context("read cold value")? else {
            return Ok(None);
        };
        decode_value(bytes.as_ref()).map(Some)
    }

    /// Write a value and record the key in the cold index. Worker-side.
    pub fn flush(&self, key: &[u8], value: &Value) -> anyhow::Result<()> {
        self.data
            .insert(key, encode_value(value))
            .context("write cold value")?;
        self.meta
            .insert(key, [])
            .context("write cold index entry")?;
        Ok(())
    }

    /// Remove a value and its cold index entry. Worker-side.
    pub fn purge(&self, key: &[u8]) -> anyhow::Result<()> {
        self.data.remove(key).context("remove cold value")?;
        self.meta.remove(key).context("remove cold index entry")?;
        Ok(())
    }

    /// Forward cursor over the whole data partition in key order.
    pub fn cursor(&self) -> FjallCursor {
        FjallCursor::new(self.data.clone())
    }

    pub fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }
}

/// Forward iterator over a sorted byte-key space.
///
/// Rocksdb-style surface: the cursor is positioned on its first entry at
/// creation; `valid()` turns false at end-of-stream, and a real store error
/// is indistinguishable from exhaustion until [`StoreCursor::take_error`] is
/// queried.
pub trait StoreCursor {
    /// Whether the cursor is positioned on an entry.
    fn valid(&self) -> bool;
    /// Current key; empty when invalid.
    fn key(&self) -> &[u8];
    /// Current value; empty when invalid.
    fn value(&self) -> &[u8];
    /// Move to the next entry.
    fn advance(&mut self);
    /// Error that terminated the scan, if any. Meaningful once `valid()` is false.
    fn take_error(&mut self) -> Option<anyhow::Error>;
}

/// [`StoreCursor`] over a fjall partition.
///
/// The underlying range iterator is not `Send`; background iteration builds
/// the cursor on the iterating thread from a `PartitionHandle` clone, which
/// is.
pub struct FjallCursor {
    iter: Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>>>,
    current: Option<fjall::KvPair>,
    error: Option<anyhow::Error>,
}

impl FjallCursor {
    pub fn new(partition: fjall::PartitionHandle) -> Self {
        let iter: Box<dyn Iterator<Item = fjall::Result<fjall::KvPair>>> =
            Box::new(partition.range(Vec::<u8>::new()..));
        let mut cursor = Self {
            iter,
            current: None,
            error: None,
        };
        cursor.advance();
        cursor
    }
}

impl StoreCursor for FjallCursor {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |(k, _)| k.as_ref())
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map_or(&[], |(_, v)| v.as_ref())
    }

    fn advance(&mut self) {
        if self.error.is_some() {
            self.current = None;
            return;
        }
        self.current = match self.iter.next() {
            Some(Ok(pair)) => Some(pair),
            Some(Err(err)) => {
                self.error = Some(err.into());
                None
            }
            None => None,
        };
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("coldswap_{name}_{}_{}", std::process::id(), nanos))
    }

    #[test]
    fn flush_fetch_purge_roundtrip() {
        let dir = temp_dir("store_roundtrip");
        let store = ColdStore::open(&dir).expect("open store");

        let value = Value::raw(b"v1".to_vec());
        store.flush(b"k1", &value).expect("flush");
        assert_eq!(store.fetch(b"k1").expect("fetch"), Some(value));

        let index = store.load_cold_index().expect("load index");
        assert!(index.contains(b"k1".as_slice()));

        store.purge(b"k1").expect("purge");
        assert_eq!(store.fetch(b"k1").expect("fetch"), None);
        assert!(store.load_cold_index().expect("load index").is_empty());

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn cursor_walks_keys_in_order() {
        let dir = temp_dir("store_cursor");
        let store = ColdStore::open(&dir).expect("open store");
        for i in [3u32, 1, 2] {
            let key = format!("k{i:04}");
            store
                .flush(key.as_bytes(), &Value::raw(vec![i as u8]))
                .expect("flush");
        }

        let mut cursor = store.cursor();
        let mut seen = Vec::new();
        while cursor.valid() {
            seen.push(cursor.key().to_vec());
            cursor.advance();
        }
        assert_eq!(seen, vec![b"k0001".to_vec(), b"k0002".to_vec(), b"k0003".to_vec()]);
        assert!(cursor.take_error().is_none());

        drop(cursor);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
