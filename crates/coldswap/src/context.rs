//! Per-key-request execution state bridging a client command to the async
//! swap machinery.

use std::sync::Arc;

use crate::client::Client;
use crate::data::SwapData;
use crate::pipeline::SwapPipeline;
use crate::request::{CommandIntention, KeyRequest, SwapIntention};
use crate::value::Value;

/// Error recorded on a context; the finished callback still fires so the
/// client resumes and can surface it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapError {
    /// Swap-intention analysis failed.
    AnalysisFailed,
    /// The worker's disk operation failed.
    Io,
}

/// Lifecycle states of one key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    Admitted,
    Analyzing,
    Submitted,
    Finished,
}

/// Invoked exactly once per request, on the data-plane thread, after the
/// swap outcome has been applied to the keyspace.
pub type FinishedCallback = Box<dyn FnOnce(&mut SwapPipeline, &mut SwapContext) + Send>;

/// Execution state for one key request.
///
/// Owns a private copy of the request; the lifecycle is linear: created at
/// dispatch, moved through the admission queue and (for async swaps) a
/// worker thread, and consumed exactly once by the completion path.
pub struct SwapContext {
    request: KeyRequest,
    cmd_intention: CommandIntention,
    intention: SwapIntention,
    state: RequestState,
    data: Option<SwapData>,
    result: Option<Value>,
    error: Option<SwapError>,
    client: Arc<Client>,
    on_finished: Option<FinishedCallback>,
}

impl SwapContext {
    /// Duplicate the request into a fresh context. Never blocks.
    pub fn new(
        client: &Arc<Client>,
        request: &KeyRequest,
        cmd_intention: CommandIntention,
        on_finished: FinishedCallback,
    ) -> Self {
        Self {
            request: request.clone(),
            cmd_intention,
            intention: SwapIntention::Nop,
            state: RequestState::Admitted,
            data: None,
            result: None,
            error: None,
            client: Arc::clone(client),
            on_finished: Some(on_finished),
        }
    }

    pub fn request(&self) -> &KeyRequest {
        &self.request
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.request.request_key()
    }

    pub fn cmd_intention(&self) -> CommandIntention {
        self.cmd_intention
    }

    pub fn intention(&self) -> SwapIntention {
        self.intention
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn error(&self) -> Option<SwapError> {
        self.error
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn data(&self) -> Option<&SwapData> {
        self.data.as_ref()
    }

    /// Value loaded by a completed `Get`, if any.
    pub fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }

    /// Identity string for trace sinks.
    pub fn trace_label(&self) -> String {
        match self.key() {
            Some(key) => format!("c{}/{}", self.client.id(), String::from_utf8_lossy(key)),
            None => format!("c{}/-", self.client.id()),
        }
    }

    pub(crate) fn set_state(&mut self, state: RequestState) {
        debug_assert!(self.state != RequestState::Finished, "request already finished");
        self.state = state;
    }

    pub(crate) fn set_intention(&mut self, intention: SwapIntention) {
        self.intention = intention;
    }

    pub(crate) fn set_data(&mut self, data: SwapData) {
        self.data = Some(data);
    }

    pub(crate) fn set_result(&mut self, result: Option<Value>) {
        self.result = result;
    }

    pub(crate) fn set_error(&mut self, error: SwapError) {
        self.error = Some(error);
    }

    /// Fire the finished callback. Idempotent: the callback is taken, so a
    /// second call is a no-op.
    pub(crate) fn fire_finished(&mut self, pipeline: &mut SwapPipeline) {
        self.state = RequestState::Finished;
        if let Some(callback) = self.on_finished.take() {
            callback(pipeline, self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(request: KeyRequest) -> SwapContext {
        let client = Arc::new(Client::new(7));
        SwapContext::new(&client, &request, CommandIntention::Read, Box::new(|_, _| {}))
    }

    #[test]
    fn new_context_starts_admitted_with_no_intention() {
        let ctx = ctx(KeyRequest::key(b"k".to_vec()));
        assert_eq!(ctx.state(), RequestState::Admitted);
        assert_eq!(ctx.intention(), SwapIntention::Nop);
        assert_eq!(ctx.key(), Some(&b"k"[..]));
        assert!(ctx.error().is_none());
    }

    #[test]
    fn result_is_taken_once() {
        let mut ctx = ctx(KeyRequest::key(b"k".to_vec()));
        ctx.set_result(Some(Value::raw(b"v".to_vec())));
        assert!(ctx.take_result().is_some());
        assert!(ctx.take_result().is_none());
    }

    #[test]
    fn trace_label_names_client_and_key() {
        assert_eq!(ctx(KeyRequest::key(b"k".to_vec())).trace_label(), "c7/k");
        assert_eq!(ctx(KeyRequest::db()).trace_label(), "c7/-");
    }
}
