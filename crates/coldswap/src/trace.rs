//! Step-trace capability injected into the swap machinery.
//!
//! Purely observational: components append short human-readable steps keyed
//! by a per-context identity string. The default sink drops everything.

use std::sync::Mutex;

pub trait TraceSink: Send + Sync {
    /// Record one step for the given context identity.
    fn append(&self, id: &str, step: &str);
}

/// Default sink; records nothing.
pub struct NoopTraceSink;

impl TraceSink for NoopTraceSink {
    fn append(&self, _id: &str, _step: &str) {}
}

/// Sink backed by the `tracing` subscriber at debug level.
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn append(&self, id: &str, step: &str) {
        tracing::debug!(target: "coldswap::trace", id, step);
    }
}

/// In-memory sink; keeps `"id step"` lines for later inspection.
#[derive(Default)]
pub struct MemoryTraceSink {
    entries: Mutex<Vec<String>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return all recorded lines in append order.
    pub fn dump(&self) -> Vec<String> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => Vec::new(),
        }
    }
}

impl TraceSink for MemoryTraceSink {
    fn append(&self, id: &str, step: &str) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.push(format!("{id} {step}"));
        }
    }
}
