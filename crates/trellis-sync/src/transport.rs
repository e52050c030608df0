//! Transport boundary
//!
//! The application supplies the actual wire: anything that can take a
//! [`SyncRequest`] and eventually call the completion: an HTTP client, a
//! local store, or the in-memory [`MemoryTransport`] used in tests and
//! demos. Completions must not be assumed to run before `send` returns.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use trellis_core::Value;

/// Persistence operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMethod {
    Create,
    Read,
    Update,
    Patch,
    Delete,
}

impl SyncMethod {
    /// Canonical HTTP verb for this operation
    pub fn verb(&self) -> &'static str {
        match self {
            SyncMethod::Create => "POST",
            SyncMethod::Read => "GET",
            SyncMethod::Update => "PUT",
            SyncMethod::Patch => "PATCH",
            SyncMethod::Delete => "DELETE",
        }
    }

    /// Lowercase operation name, as carried by `request` events
    pub fn name(&self) -> &'static str {
        match self {
            SyncMethod::Create => "create",
            SyncMethod::Read => "read",
            SyncMethod::Update => "update",
            SyncMethod::Patch => "patch",
            SyncMethod::Delete => "delete",
        }
    }
}

/// One persistence request
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub method: SyncMethod,
    pub url: String,
    /// Attribute payload for write operations
    pub body: Option<Value>,
}

/// Callback invoked when a request completes
pub type Completion = Box<dyn FnOnce(Result<Value>)>;

/// The pluggable persistence wire
pub trait Transport {
    /// Dispatch `request`; call `done` exactly once when it completes
    ///
    /// Completion may happen at any later point; callers never rely on it
    /// running before `send` returns.
    fn send(&self, request: SyncRequest, done: Completion);
}

struct MemoryState {
    pending: VecDeque<(SyncRequest, Completion)>,
    log: Vec<SyncRequest>,
}

/// In-memory transport that holds requests until told to respond
///
/// Useful in tests and demos: requests queue up, and the caller resolves
/// them explicitly with [`respond`](MemoryTransport::respond), exercising
/// the deferred-completion contract.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryTransport {
    /// Create an empty transport
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState {
                pending: VecDeque::new(),
                log: Vec::new(),
            })),
        }
    }

    /// Number of requests waiting for a response
    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Every request ever sent, in order
    pub fn requests(&self) -> Vec<SyncRequest> {
        self.state.borrow().log.clone()
    }

    /// The most recently sent request
    pub fn last_request(&self) -> Option<SyncRequest> {
        self.state.borrow().log.last().cloned()
    }

    /// Complete the oldest pending request with `result`
    ///
    /// Returns false when nothing was pending.
    pub fn respond(&self, result: Result<Value>) -> bool {
        let next = self.state.borrow_mut().pending.pop_front();
        match next {
            Some((_, done)) => {
                done(result);
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, request: SyncRequest, done: Completion) {
        let mut state = self.state.borrow_mut();
        state.log.push(request.clone());
        state.pending.push_back((request, done));
    }
}
