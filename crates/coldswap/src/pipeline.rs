//! The data plane: swap decisions, request admission, completion draining,
//! and command resumption.
//!
//! Everything here runs on a single thread. `proceed` never blocks on disk;
//! async swaps go to the worker pool and come back through the completion
//! channel, which [`SwapPipeline::drain_completions`] empties on the same
//! thread that made the decisions.

use std::path::Path;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use crate::admission::AdmissionQueue;
use crate::client::{Client, PendingCommand};
use crate::context::{FinishedCallback, RequestState, SwapContext, SwapError};
use crate::data::SwapData;
use crate::hold::KeyHolds;
use crate::iterator::StoreIterator;
use crate::request::{ColdReadAnalyzer, CommandIntention, IntentionAnalyzer, KeyRequest, SwapIntention};
use crate::store::{ColdStore, KeyspaceState, StoreCursor};
use crate::trace::{NoopTraceSink, TraceSink};
use crate::worker::{SwapWorkerPool, WorkerStatsSnapshot};
use crate::{ResumeOrder, SwapConfig};

/// Applies backpressure to a client whose command is parked on outstanding
/// swaps. Invoked after dispatch while requests remain in flight.
pub trait RateLimiter: Send + Sync {
    fn pause(&self, client: &Client);
}

pub struct NoopLimiter;

impl RateLimiter for NoopLimiter {
    fn pause(&self, _client: &Client) {}
}

/// Collaborator hooks run during command resumption.
///
/// `wake_blocked_keys` wakes clients blocked on keys the finished command
/// made available; `replay_pending_input` re-enters the parser for input
/// that was buffered while the client was swapping. Their relative order is
/// set by [`ResumeOrder`].
pub trait ResumeHooks: Send + Sync {
    fn wake_blocked_keys(&self, _client: &Client) {}
    fn replay_pending_input(&self, _client: &Client) {}
}

pub struct NoopResumeHooks;

impl ResumeHooks for NoopResumeHooks {}

/// A parsed client command as the pipeline sees it: an intention toward its
/// keys and the body to run once every swap finished.
pub struct Command {
    pub intention: CommandIntention,
    pub keys: Vec<Vec<u8>>,
    pub exec: PendingCommand,
}

impl Command {
    pub fn new(intention: CommandIntention, keys: Vec<Vec<u8>>, exec: PendingCommand) -> Self {
        Self {
            intention,
            keys,
            exec,
        }
    }
}

/// Data-plane counters.
#[derive(Default, Clone, Copy, Debug)]
pub struct PipelineStatsSnapshot {
    /// Requests completed synchronously inside `proceed` (no-swap paths).
    pub inline_completions: u64,
    /// Requests completed from the completion drain.
    pub async_completions: u64,
    /// Commands resumed.
    pub resumes: u64,
    /// Resumptions discarded because the client was marked for close.
    pub discarded_resumes: u64,
}

/// Builder for a [`SwapPipeline`]; collaborators must be set before the
/// worker pool spawns, so they are taken here rather than on the pipeline.
pub struct PipelineBuilder {
    config: SwapConfig,
    analyzer: Arc<dyn IntentionAnalyzer>,
    limiter: Arc<dyn RateLimiter>,
    hooks: Arc<dyn ResumeHooks>,
    trace: Arc<dyn TraceSink>,
}

impl PipelineBuilder {
    pub fn new(config: SwapConfig) -> Self {
        Self {
            config,
            analyzer: Arc::new(ColdReadAnalyzer),
            limiter: Arc::new(NoopLimiter),
            hooks: Arc::new(NoopResumeHooks),
            trace: Arc::new(NoopTraceSink),
        }
    }

    pub fn analyzer(mut self, analyzer: Arc<dyn IntentionAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn ResumeHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = trace;
        self
    }

    pub fn open(self, path: impl AsRef<Path>) -> anyhow::Result<SwapPipeline> {
        let store = ColdStore::open(path)?;
        self.open_store(store)
    }

    pub fn open_store(self, store: ColdStore) -> anyhow::Result<SwapPipeline> {
        let cold = store.load_cold_index()?;
        let (completion_tx, completion_rx) = mpsc::channel();
        let workers = SwapWorkerPool::spawn(
            store.clone(),
            self.config.worker_threads,
            completion_tx,
            Arc::clone(&self.trace),
        )?;
        Ok(SwapPipeline {
            store,
            keyspace: KeyspaceState::new(cold),
            admission: AdmissionQueue::new(),
            holds: KeyHolds::new(),
            workers: Some(workers),
            completion_rx,
            analyzer: self.analyzer,
            limiter: self.limiter,
            hooks: self.hooks,
            trace: self.trace,
            resume_order: self.config.resume_order,
            iter_buffer_capacity: self.config.iter_buffer_capacity,
            repl_offset: 0,
            stats: PipelineStatsSnapshot::default(),
        })
    }
}

pub struct SwapPipeline {
    store: ColdStore,
    keyspace: KeyspaceState,
    admission: AdmissionQueue,
    holds: KeyHolds,
    workers: Option<SwapWorkerPool>,
    completion_rx: mpsc::Receiver<SwapContext>,
    analyzer: Arc<dyn IntentionAnalyzer>,
    limiter: Arc<dyn RateLimiter>,
    hooks: Arc<dyn ResumeHooks>,
    trace: Arc<dyn TraceSink>,
    resume_order: ResumeOrder,
    iter_buffer_capacity: usize,
    repl_offset: u64,
    stats: PipelineStatsSnapshot,
}

impl SwapPipeline {
    pub fn builder(config: SwapConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Open a pipeline with default collaborators.
    pub fn open(path: impl AsRef<Path>, config: SwapConfig) -> anyhow::Result<Self> {
        Self::builder(config).open(path)
    }

    pub fn keyspace(&self) -> &KeyspaceState {
        &self.keyspace
    }

    pub fn keyspace_mut(&mut self) -> &mut KeyspaceState {
        &mut self.keyspace
    }

    pub fn store(&self) -> &ColdStore {
        &self.store
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats
    }

    pub fn worker_stats(&self) -> WorkerStatsSnapshot {
        self.workers
            .as_ref()
            .map(SwapWorkerPool::stats_snapshot)
            .unwrap_or_default()
    }

    /// Spawn a store iterator streaming the cold data partition. The cursor
    /// is opened on the iterator's own thread.
    pub fn iterator(&self) -> anyhow::Result<StoreIterator> {
        let store = self.store.clone();
        StoreIterator::spawn(
            move || Box::new(store.cursor()) as Box<dyn StoreCursor>,
            self.iter_buffer_capacity,
        )
    }

    /// Entry point for a parsed command.
    ///
    /// Derives the key requests (replica links are serialized at db level),
    /// submits them, and applies the rate-limiter pause when requests remain
    /// outstanding after submission. When every request completes within
    /// this call, the command has already executed by the time it returns.
    pub fn dispatch(&mut self, client: &Arc<Client>, command: Command) {
        let requests = derive_requests(client, &command);
        client.begin_command(command.exec);
        self.submit_client_key_requests(client, command.intention, requests);
        if client.outstanding() > 0 {
            self.limiter.pause(client);
        }
    }

    /// Create, hold, and admit one context per key request.
    ///
    /// The outstanding counter covers all requests before the first one is
    /// admitted, so a synchronous burst of completions cannot resume the
    /// command early.
    pub fn submit_client_key_requests(
        &mut self,
        client: &Arc<Client>,
        intention: CommandIntention,
        requests: Vec<KeyRequest>,
    ) {
        client.enter_swapping();
        if requests.is_empty() {
            self.resume_command(client);
            return;
        }
        client.add_outstanding(requests.len() as u64);
        for request in requests {
            let owner = Arc::clone(client);
            let callback: FinishedCallback =
                Box::new(move |pipeline, ctx| pipeline.on_request_finished(&owner, ctx));
            let ctx = SwapContext::new(client, &request, intention, callback);
            if let Some(key) = request.request_key() {
                self.holds.hold(client.id(), key);
            }
            if let Some(ctx) = self.admission.admit(ctx) {
                self.proceed(ctx);
            }
        }
    }

    /// The decision step for one admitted request. Data-plane only.
    ///
    /// Every path out of here completes the request exactly once: the
    /// no-swap paths synchronously within this call, the rest later from
    /// the completion drain. Callers must not assume which.
    pub fn proceed(&mut self, mut ctx: SwapContext) {
        ctx.set_state(RequestState::Analyzing);
        self.trace.append(&ctx.trace_label(), "proceed");

        let Some(key) = ctx.key().map(<[u8]>::to_vec) else {
            // Server/db-level request; nothing to swap.
            return self.complete_request(ctx, true);
        };
        let mem = self.keyspace.get(&key).cloned();
        let cold = self.keyspace.is_cold(&key);
        if mem.is_none() && !cold {
            // Key not exists.
            return self.complete_request(ctx, true);
        }
        let Some(data) = SwapData::build(&key, mem, cold) else {
            // Value kind unsupported for swapping; normal no-swap.
            return self.complete_request(ctx, true);
        };
        let intention = match self.analyzer.analyze(&data, ctx.cmd_intention(), ctx.request()) {
            Ok(intention) => intention,
            Err(err) => {
                tracing::debug!(error = ?err, "swap intention analysis failed");
                ctx.set_error(SwapError::AnalysisFailed);
                return self.complete_request(ctx, true);
            }
        };
        if intention == SwapIntention::Nop {
            return self.complete_request(ctx, true);
        }

        ctx.set_intention(intention);
        ctx.set_data(data);
        ctx.set_state(RequestState::Submitted);
        self.trace.append(&ctx.trace_label(), "submitted");
        let submitted = match &self.workers {
            Some(pool) => pool.submit(ctx),
            None => Err(ctx),
        };
        if let Err(mut ctx) = submitted {
            ctx.set_error(SwapError::Io);
            self.complete_request(ctx, true);
        }
    }

    /// Process completed async swaps on the data-plane thread.
    ///
    /// Optionally blocks up to `wait` for the first completion, then drains
    /// whatever else is ready. Returns the number of requests completed.
    pub fn drain_completions(&mut self, wait: Option<Duration>) -> usize {
        let mut completed = 0;
        if let Some(wait) = wait {
            match self.completion_rx.recv_timeout(wait) {
                Ok(ctx) => {
                    self.complete_request(ctx, false);
                    completed += 1;
                }
                Err(_) => return completed,
            }
        }
        while let Ok(ctx) = self.completion_rx.try_recv() {
            self.complete_request(ctx, false);
            completed += 1;
        }
        completed
    }

    /// Drain completions until the client has no outstanding requests.
    pub fn wait_for_client(&mut self, client: &Client, timeout: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        while client.outstanding() > 0 {
            anyhow::ensure!(
                Instant::now() < deadline,
                "timed out waiting for client {} swaps",
                client.id()
            );
            self.drain_completions(Some(Duration::from_millis(10)));
        }
        Ok(())
    }

    /// Decrement the client's outstanding counter; on the transition to
    /// zero, resume the command — unless the client is marked for deferred
    /// close, in which case the pending command is discarded.
    pub fn on_request_finished(&mut self, client: &Arc<Client>, ctx: &mut SwapContext) {
        if let Some(error) = ctx.error() {
            client.set_swap_error(error);
        }
        let remaining = client.finish_one();
        if remaining > 0 {
            return;
        }
        if client.is_close_deferred() {
            client.take_pending();
            client.end_swapping();
            self.holds.unhold_all(client.id());
            self.stats.discarded_resumes += 1;
            return;
        }
        self.resume_command(client);
    }

    /// Run the parked command and its post-execution bookkeeping.
    ///
    /// Guarded by the swapping flag, so it runs at most once per dispatch
    /// and never re-enters for a client already resuming.
    pub fn resume_command(&mut self, client: &Arc<Client>) {
        if !client.end_swapping() {
            return;
        }
        self.stats.resumes += 1;
        if let Some(command) = client.take_pending() {
            command(&mut self.keyspace);
        }
        client.mark_processed();
        self.repl_offset += 1;
        client.note_repl_offset(self.repl_offset);
        self.holds.unhold_all(client.id());
        match self.resume_order {
            ResumeOrder::WakeThenReplay => {
                self.hooks.wake_blocked_keys(client);
                self.hooks.replay_pending_input(client);
            }
            ResumeOrder::ReplayThenWake => {
                self.hooks.replay_pending_input(client);
                self.hooks.wake_blocked_keys(client);
            }
        }
    }

    /// Join the worker pool and complete whatever it delivered on the way
    /// out. Queued admission waiters are dropped without their callbacks;
    /// past this point there is no client left to resume into.
    pub fn shutdown(&mut self) {
        if let Some(mut pool) = self.workers.take() {
            pool.shutdown();
        }
        while let Ok(ctx) = self.completion_rx.try_recv() {
            self.complete_request(ctx, false);
        }
    }

    /// Apply the swap outcome, fire the finished callback, and hand the key
    /// to the next admission waiter.
    fn complete_request(&mut self, mut ctx: SwapContext, inline: bool) {
        if inline {
            self.stats.inline_completions += 1;
        } else {
            self.stats.async_completions += 1;
        }
        self.apply_result(&mut ctx);
        self.trace.append(&ctx.trace_label(), "finished");
        ctx.fire_finished(self);
        if let Some(key) = ctx.key().map(<[u8]>::to_vec) {
            if let Some(next) = self.admission.release(&key) {
                self.proceed(next);
            }
        }
    }

    /// Fold a completed disk operation into the in-memory keyspace.
    fn apply_result(&mut self, ctx: &mut SwapContext) {
        if ctx.error().is_some() {
            return;
        }
        let Some(key) = ctx.key().map(<[u8]>::to_vec) else {
            return;
        };
        match ctx.intention() {
            SwapIntention::Get => {
                if let Some(value) = ctx.take_result() {
                    self.keyspace.insert(key, value);
                }
            }
            SwapIntention::Put => {
                self.keyspace.remove(&key);
                self.keyspace.mark_cold(key);
            }
            SwapIntention::Del => {
                self.keyspace.remove(&key);
                self.keyspace.clear_cold(&key);
            }
            SwapIntention::Nop => {}
        }
    }
}

impl Drop for SwapPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn derive_requests(client: &Client, command: &Command) -> Vec<KeyRequest> {
    if client.is_replica_link() {
        // Replication links apply writes in stream order; serialize the
        // whole apply at db level instead of per key.
        return vec![KeyRequest::db()];
    }
    if command.keys.is_empty() {
        return vec![KeyRequest::server()];
    }
    command
        .keys
        .iter()
        .map(|key| KeyRequest::key(key.clone()))
        .collect()
}
