//! Asynchronous key-swap pipeline for a hybrid memory/disk key-value store.
//!
//! A single-threaded data plane owns the in-memory keyspace. Per key touched
//! by a command, the pipeline decides whether the value must first be fetched
//! from (or flushed to) the persistent store, hands that operation to a pool
//! of swap-worker threads, and resumes the command once every outstanding
//! swap for the client has finished. The [`iterator`] module provides the
//! companion bounded producer/consumer iterator that streams key/value pairs
//! out of the persistent store on a background thread.

use std::env;
use std::str::FromStr;

pub mod admission;
pub mod client;
pub mod context;
pub mod data;
pub mod hold;
pub mod iterator;
pub mod pipeline;
pub mod request;
pub mod store;
pub mod trace;
pub mod value;
pub mod worker;

pub use client::Client;
pub use context::{SwapContext, SwapError};
pub use data::SwapData;
pub use iterator::{BufferedQueue, StagedEntry, StoreIterator};
pub use pipeline::{
    Command, NoopLimiter, NoopResumeHooks, PipelineBuilder, PipelineStatsSnapshot, RateLimiter,
    ResumeHooks, SwapPipeline,
};
pub use request::{CommandIntention, IntentionAnalyzer, KeyRequest, RequestLevel, SwapIntention};
pub use store::{ColdStore, KeyspaceState, StoreCursor};
pub use trace::{LogTraceSink, MemoryTraceSink, NoopTraceSink, TraceSink};
pub use value::{Value, ValueKind};
pub use worker::{SwapWorkerPool, WorkerStatsSnapshot};

/// Default number of swap-worker threads.
const DEFAULT_WORKER_THREADS: usize = 4;
/// Default ring-buffer capacity for store iterators.
const DEFAULT_ITER_BUFFER_CAPACITY: usize = 16;

/// Relative order of the two resumption hooks (see the `ResumeHooks` trait).
///
/// Whether clients blocked on now-available keys are woken before or after
/// the resumed client's buffered pipelined input is replayed is a
/// collaborator contract, not something this core pins down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeOrder {
    WakeThenReplay,
    ReplayThenWake,
}

/// Runtime configuration for a [`SwapPipeline`].
#[derive(Clone, Copy, Debug)]
pub struct SwapConfig {
    /// Number of swap-worker threads performing disk I/O.
    pub worker_threads: usize,
    /// Ring-buffer capacity used by [`StoreIterator`]s spawned via the pipeline.
    pub iter_buffer_capacity: usize,
    /// Hook ordering during command resumption.
    pub resume_order: ResumeOrder,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            iter_buffer_capacity: DEFAULT_ITER_BUFFER_CAPACITY,
            resume_order: ResumeOrder::WakeThenReplay,
        }
    }
}

impl SwapConfig {
    /// Build a config from defaults plus `COLDSWAP_*` env overrides.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_threads: read_env_usize("COLDSWAP_WORKER_THREADS", defaults.worker_threads)
                .max(1),
            iter_buffer_capacity: read_env_usize(
                "COLDSWAP_ITER_BUFFER_CAPACITY",
                defaults.iter_buffer_capacity,
            )
            .max(1),
            resume_order: parse_resume_order(env::var("COLDSWAP_RESUME_ORDER").ok().as_deref())
                .unwrap_or(defaults.resume_order),
        }
    }
}

/// Read an env var as usize with a default.
pub(crate) fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}

/// Parse the requested resume order from a string.
fn parse_resume_order(value: Option<&str>) -> Option<ResumeOrder> {
    match value.map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "wake_first" => Some(ResumeOrder::WakeThenReplay),
        Some(v) if v == "replay_first" => Some(ResumeOrder::ReplayThenWake),
        _ => None,
    }
}
