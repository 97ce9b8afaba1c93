//! Request lifecycle tracking.
//!
//! Every enqueued operation becomes a [`Request`] stored in the
//! [`RequestTable`]. Callers see a monotonic [`RequestId`]; the kernel sees
//! the table key encoded in the operation token. Ids are never reused for
//! the engine's lifetime, so a stale handle always resolves to `NotFound`
//! rather than to somebody else's request.

use crate::error::{EngineError, ErrorKind};
use crate::runtime::buffer::SlotSpan;
use bytes::Bytes;
use slab::Slab;
use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;

/// Caller-visible request handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
}

/// An operation to enqueue.
#[derive(Debug, Clone)]
pub struct Op {
    pub fd: RawFd,
    pub kind: OpKind,
    pub offset: u64,
    pub len: usize,
    /// Payload for writes; must be exactly `len` bytes.
    pub data: Option<Bytes>,
}

impl Op {
    /// Read `len` bytes at `offset`.
    pub fn read(fd: RawFd, offset: u64, len: usize) -> Self {
        Self {
            fd,
            kind: OpKind::Read,
            offset,
            len,
            data: None,
        }
    }

    /// Write `data` at `offset`.
    pub fn write(fd: RawFd, offset: u64, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            fd,
            kind: OpKind::Write,
            offset,
            len: data.len(),
            data: Some(data),
        }
    }
}

/// Data produced by a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// The full requested byte range.
    Read(Bytes),
    /// Number of bytes written (always the requested length).
    Written(usize),
}

/// Terminal result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(Output),
    Failed(ErrorKind),
}

impl Outcome {
    /// Read data, if this is a completed read.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Outcome::Completed(Output::Read(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }
}

/// Result of a cancellation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The request is now `Cancelled`.
    Cancelled,
    /// The request had already reached a terminal state.
    AlreadyTerminal,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Holding buffers, waiting for ring capacity.
    Queued,
    /// Handed to the kernel (possibly across several short-I/O rounds).
    Submitted,
    Completed,
    Failed(ErrorKind),
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed | RequestState::Failed(_) | RequestState::Cancelled
        )
    }
}

/// iovec array referenced by an in-flight kernel operation.
#[derive(Default)]
pub(crate) struct IoVecs(pub(crate) Vec<libc::iovec>);

// Safety: the iovecs point into the buffer pool, which is Send + Sync; the
// array itself is only touched by whoever holds the engine state lock.
unsafe impl Send for IoVecs {}

impl fmt::Debug for IoVecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|v| (v.iov_base, v.iov_len)))
            .finish()
    }
}

/// One outstanding I/O operation.
#[derive(Debug)]
pub struct Request {
    pub(crate) id: RequestId,
    pub(crate) fd: RawFd,
    pub(crate) kind: OpKind,
    pub(crate) offset: u64,
    pub(crate) len: usize,
    pub(crate) span: SlotSpan,
    pub(crate) state: RequestState,
    /// Bytes transferred so far across short-I/O rounds.
    pub(crate) transferred: usize,
    /// A kernel operation referencing `span` is outstanding.
    pub(crate) in_kernel: bool,
    /// The caller retrieved the terminal outcome; entry awaits removal.
    pub(crate) acknowledged: bool,
    /// Must stay alive while `in_kernel` is set.
    pub(crate) iov: IoVecs,
}

impl Request {
    pub(crate) fn new(id: RequestId, op: &Op, span: SlotSpan) -> Self {
        Self {
            id,
            fd: op.fd,
            kind: op.kind,
            offset: op.offset,
            len: op.len,
            span,
            state: RequestState::Queued,
            transferred: 0,
            in_kernel: false,
            acknowledged: false,
            iov: IoVecs::default(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Bytes still to transfer.
    pub fn remaining(&self) -> usize {
        self.len - self.transferred
    }

    /// Move to a new state. Terminal states are sticky.
    pub(crate) fn transition(&mut self, next: RequestState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = next;
        true
    }
}

/// Table of live requests keyed by id, backed by a slab.
///
/// O(1) lookup by kernel token (slab key) and by caller id.
pub struct RequestTable {
    entries: Slab<Request>,
    ids: HashMap<RequestId, usize>,
    next_id: u64,
}

impl RequestTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            ids: HashMap::with_capacity(capacity),
            next_id: 1,
        }
    }

    /// Reserve the next id. Ids are monotonic and never reused.
    pub fn next_id(&mut self) -> RequestId {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Store a request, returning its table key.
    pub fn create(&mut self, request: Request) -> usize {
        let id = request.id;
        let key = self.entries.insert(request);
        self.ids.insert(id, key);
        key
    }

    /// Table key for a caller-visible id.
    pub fn key(&self, id: RequestId) -> Result<usize, EngineError> {
        match self.ids.get(&id) {
            Some(&key) if !self.entries[key].acknowledged => Ok(key),
            _ => Err(EngineError::NotFound(id)),
        }
    }

    pub fn get(&self, id: RequestId) -> Result<&Request, EngineError> {
        let key = self.key(id)?;
        Ok(&self.entries[key])
    }

    pub fn get_mut(&mut self, id: RequestId) -> Result<&mut Request, EngineError> {
        let key = self.key(id)?;
        Ok(&mut self.entries[key])
    }

    /// Lookup by kernel token key.
    pub fn by_key(&self, key: usize) -> Option<&Request> {
        self.entries.get(key)
    }

    pub fn by_key_mut(&mut self, key: usize) -> Option<&mut Request> {
        self.entries.get_mut(key)
    }

    /// Remove a terminal request.
    ///
    /// # Panics
    /// Panics if the request is not terminal or the kernel still references
    /// its buffers; both indicate a broken engine invariant.
    pub fn remove(&mut self, key: usize) -> Request {
        let request = &self.entries[key];
        assert!(
            request.state.is_terminal(),
            "removing request {} in non-terminal state {:?}",
            request.id,
            request.state
        );
        assert!(
            !request.in_kernel,
            "removing request {} while the kernel owns its buffers",
            request.id
        );
        let request = self.entries.remove(key);
        self.ids.remove(&request.id);
        request
    }

    /// Number of entries, including acknowledged ones awaiting removal.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of requests not yet terminal.
    pub fn active(&self) -> usize {
        self.entries
            .iter()
            .filter(|(_, r)| !r.state.is_terminal())
            .count()
    }

    /// Number of requests whose buffers the kernel still references.
    pub fn in_kernel(&self) -> usize {
        self.entries.iter().filter(|(_, r)| r.in_kernel).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Request)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Request)> {
        self.entries.iter_mut()
    }
}
