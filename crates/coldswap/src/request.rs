//! Key requests, swap intentions, and the intention-analysis seam.

use crate::data::SwapData;

/// Scope of a key request derived from a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestLevel {
    /// Server-wide request; no key attached.
    Server,
    /// Whole-database request; no key attached.
    Db,
    /// Request against a single key (plus optional subkeys).
    Key,
}

/// Per-key unit of intent derived from a client command.
///
/// Producers keep their own copy; the pipeline clones the request into each
/// [`crate::SwapContext`] it creates.
#[derive(Clone, Debug)]
pub struct KeyRequest {
    level: RequestLevel,
    key: Option<Vec<u8>>,
    subkeys: Vec<Vec<u8>>,
}

impl KeyRequest {
    pub fn server() -> Self {
        Self {
            level: RequestLevel::Server,
            key: None,
            subkeys: Vec::new(),
        }
    }

    pub fn db() -> Self {
        Self {
            level: RequestLevel::Db,
            key: None,
            subkeys: Vec::new(),
        }
    }

    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            level: RequestLevel::Key,
            key: Some(key.into()),
            subkeys: Vec::new(),
        }
    }

    pub fn key_with_subkeys(key: impl Into<Vec<u8>>, subkeys: Vec<Vec<u8>>) -> Self {
        Self {
            level: RequestLevel::Key,
            key: Some(key.into()),
            subkeys,
        }
    }

    pub fn level(&self) -> RequestLevel {
        self.level
    }

    /// The requested key; `None` for server/db-level requests.
    pub fn request_key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Requested subkeys, in command order.
    pub fn subkeys(&self) -> &[Vec<u8>] {
        &self.subkeys
    }
}

/// What the command intends to do with the keys it touches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandIntention {
    /// Read the value; a cold value must be swapped in first.
    Read,
    /// Modify the value; a cold value must be swapped in first.
    Write,
    /// Flush the in-memory value to the persistent store.
    Evict,
    /// Delete the key everywhere.
    Delete,
}

/// Decided swap operation for one key request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapIntention {
    Nop,
    Get,
    Put,
    Del,
}

/// Decides the swap intention for a key given its current representations.
///
/// The decision algorithm itself is a collaborator; the pipeline only
/// consumes its verdict. An `Err` is recorded on the context as
/// [`crate::SwapError::AnalysisFailed`] and completes the request without a
/// swap.
pub trait IntentionAnalyzer: Send + Sync {
    fn analyze(
        &self,
        data: &SwapData,
        intention: CommandIntention,
        request: &KeyRequest,
    ) -> anyhow::Result<SwapIntention>;
}

/// Default analyzer: swap in cold values before reads and writes, flush
/// resident values on evictions, purge the on-disk copy on deletes.
pub struct ColdReadAnalyzer;

impl IntentionAnalyzer for ColdReadAnalyzer {
    fn analyze(
        &self,
        data: &SwapData,
        intention: CommandIntention,
        _request: &KeyRequest,
    ) -> anyhow::Result<SwapIntention> {
        let decided = match intention {
            CommandIntention::Read | CommandIntention::Write => {
                if !data.in_memory() && data.on_disk() {
                    SwapIntention::Get
                } else {
                    SwapIntention::Nop
                }
            }
            CommandIntention::Evict => {
                if data.in_memory() {
                    SwapIntention::Put
                } else {
                    SwapIntention::Nop
                }
            }
            CommandIntention::Delete => {
                if data.on_disk() {
                    SwapIntention::Del
                } else {
                    SwapIntention::Nop
                }
            }
        };
        Ok(decided)
    }
}
