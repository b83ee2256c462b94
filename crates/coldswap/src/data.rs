//! `SwapData`: a value together with whichever of its in-memory and on-disk
//! representations currently exist, plus the worker-side disk operations.

use anyhow::Context;

use crate::request::SwapIntention;
use crate::store::ColdStore;
use crate::value::Value;

/// Snapshot of a key's representations, built on the data plane and handed
/// to the swap workers. Workers operate on this alone; they never touch the
/// shared in-memory keyspace.
pub struct SwapData {
    key: Vec<u8>,
    mem: Option<Value>,
    cold: bool,
}

impl SwapData {
    /// Build swap data from the representations that exist.
    ///
    /// Returns `None` when the in-memory value's kind is unsupported for
    /// swapping; that is a normal no-swap condition, not an error.
    pub fn build(key: &[u8], mem: Option<Value>, cold: bool) -> Option<Self> {
        if let Some(value) = &mem {
            if !value.swappable() {
                return None;
            }
        }
        Some(Self {
            key: key.to_vec(),
            mem,
            cold,
        })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn in_memory(&self) -> bool {
        self.mem.is_some()
    }

    pub fn on_disk(&self) -> bool {
        self.cold
    }

    /// Perform the decided disk operation. Runs on a swap-worker thread.
    ///
    /// A `Get` yields the loaded value; `Put` and `Del` yield nothing.
    pub(crate) fn execute(
        &self,
        intention: SwapIntention,
        store: &ColdStore,
    ) -> anyhow::Result<Option<Value>> {
        match intention {
            SwapIntention::Get => store.fetch(&self.key),
            SwapIntention::Put => {
                let value = self
                    .mem
                    .as_ref()
                    .context("put swap without an in-memory value")?;
                store.flush(&self.key, value)?;
                Ok(None)
            }
            SwapIntention::Del => {
                store.purge(&self.key)?;
                Ok(None)
            }
            SwapIntention::Nop => Ok(None),
        }
    }
}
