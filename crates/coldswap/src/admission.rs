//! Per-key FIFO admission: at most one swap proceeds against a key at a
//! time; concurrent requests on the same key wait in submission order.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use crate::context::SwapContext;

/// Data-plane structure; presence of a key entry means a request for that
/// key is in flight, and the deque holds the waiters behind it.
#[derive(Default)]
pub struct AdmissionQueue {
    keys: HashMap<Vec<u8>, VecDeque<SwapContext>>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a context. Returns it when the caller may run `proceed` now;
    /// otherwise the context waits behind the key's in-flight request.
    /// Requests without a key bypass serialization entirely.
    pub fn admit(&mut self, ctx: SwapContext) -> Option<SwapContext> {
        let Some(key) = ctx.key() else {
            return Some(ctx);
        };
        match self.keys.entry(key.to_vec()) {
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                Some(ctx)
            }
            Entry::Occupied(mut slot) => {
                slot.get_mut().push_back(ctx);
                None
            }
        }
    }

    /// Release a key after its in-flight request finished. Returns the next
    /// waiter, which keeps the key busy; the entry is removed when no
    /// waiters remain.
    pub fn release(&mut self, key: &[u8]) -> Option<SwapContext> {
        let Entry::Occupied(mut slot) = self.keys.entry(key.to_vec()) else {
            return None;
        };
        match slot.get_mut().pop_front() {
            Some(next) => Some(next),
            None => {
                slot.remove();
                None
            }
        }
    }

    /// Whether a request for `key` is currently in flight.
    pub fn is_busy(&self, key: &[u8]) -> bool {
        self.keys.contains_key(key)
    }

    /// Number of requests waiting behind the in-flight one.
    pub fn pending(&self, key: &[u8]) -> usize {
        self.keys.get(key).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::request::{CommandIntention, KeyRequest};
    use std::sync::Arc;

    fn ctx(client: &Arc<Client>, key: &[u8]) -> SwapContext {
        SwapContext::new(
            client,
            &KeyRequest::key(key.to_vec()),
            CommandIntention::Read,
            Box::new(|_, _| {}),
        )
    }

    #[test]
    fn same_key_requests_wait_in_submission_order() {
        let client = Arc::new(Client::new(1));
        let mut queue = AdmissionQueue::new();

        let first = queue.admit(ctx(&client, b"k"));
        assert!(first.is_some(), "first admission should proceed");
        assert!(queue.admit(ctx(&client, b"k")).is_none());
        assert!(queue.admit(ctx(&client, b"k")).is_none());
        assert_eq!(queue.pending(b"k"), 2);

        assert!(queue.release(b"k").is_some(), "second should be next");
        assert!(queue.release(b"k").is_some(), "third should follow");
        assert!(queue.release(b"k").is_none());
        assert!(!queue.is_busy(b"k"));
    }

    #[test]
    fn keyless_requests_bypass_admission() {
        let client = Arc::new(Client::new(1));
        let mut queue = AdmissionQueue::new();
        let ctx = SwapContext::new(
            &client,
            &KeyRequest::db(),
            CommandIntention::Read,
            Box::new(|_, _| {}),
        );
        assert!(queue.admit(ctx).is_some());
    }

    #[test]
    fn distinct_keys_do_not_serialize() {
        let client = Arc::new(Client::new(1));
        let mut queue = AdmissionQueue::new();
        assert!(queue.admit(ctx(&client, b"a")).is_some());
        assert!(queue.admit(ctx(&client, b"b")).is_some());
        assert!(queue.is_busy(b"a"));
        assert!(queue.is_busy(b"b"));
    }
}
