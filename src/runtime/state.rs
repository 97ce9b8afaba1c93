//! State shared between caller threads and the driver thread.
//!
//! The buffer pool, request table and the submission FIFO live behind one
//! mutex. Callers take it briefly to enqueue, cancel or retrieve; the driver
//! takes it to move work into the ring and to apply completions. The ring
//! itself is never behind the lock: only the driver touches it.

use crate::error::{EngineError, ErrorKind};
use crate::runtime::buffer::BufferPool;
use crate::runtime::request::{
    OpKind, Outcome, Output, Request, RequestId, RequestState, RequestTable,
};
use crate::runtime::ring::Notify;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::error;

/// Engine driver lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Accepting and executing work.
    Running,
    /// No new work accepted; finishing what was accepted until `deadline`.
    Draining { deadline: Option<Instant> },
    /// Driver exited and the ring is closed.
    Stopped,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Requests accepted by `submit`.
    pub enqueued: u64,
    /// Kernel operations issued, including short-I/O follow-ups.
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Requests forced to `Failed(Cancelled)` by a shutdown timeout.
    pub forced: u64,
    /// Follow-up operations issued after a short or interrupted transfer.
    pub short_io_retries: u64,
    /// Requests with a kernel operation outstanding right now.
    pub in_flight: usize,
    /// Highest `in_flight` ever observed.
    pub in_flight_high_water: usize,
    /// Requests waiting for ring capacity.
    pub queued: usize,
    /// Free buffer slots.
    pub free_slots: usize,
}

pub(crate) struct State {
    pub(crate) pool: BufferPool,
    pub(crate) table: RequestTable,
    /// Queued requests in enqueue order (table keys).
    pub(crate) queue: VecDeque<usize>,
    /// Submitted requests awaiting a follow-up after a short transfer.
    pub(crate) retries: VecDeque<usize>,
    /// Requests whose in-kernel operation should be cancelled.
    pub(crate) cancels: Vec<usize>,
    /// Requests with a kernel operation outstanding.
    pub(crate) in_flight: usize,
    /// Backpressure ceiling on `in_flight`.
    pub(crate) ring_depth: usize,
    pub(crate) phase: Phase,
    pub(crate) stats: EngineStats,
}

impl State {
    pub(crate) fn new(pool: BufferPool, ring_depth: usize) -> Self {
        let capacity = pool.capacity();
        Self {
            pool,
            table: RequestTable::new(capacity),
            queue: VecDeque::with_capacity(capacity),
            retries: VecDeque::with_capacity(ring_depth),
            cancels: Vec::new(),
            in_flight: 0,
            ring_depth,
            phase: Phase::Running,
            stats: EngineStats::default(),
        }
    }

    pub(crate) fn stats(&self) -> EngineStats {
        EngineStats {
            in_flight: self.in_flight,
            queued: self.queue.len(),
            free_slots: self.pool.available(),
            ..self.stats
        }
    }

    /// Take the terminal outcome of `id`, if it has one.
    ///
    /// Retrieval acknowledges the request: read data is copied out, slots go
    /// back to the pool and the entry is removed (or marked for removal once
    /// the kernel lets go of its buffers).
    pub(crate) fn retrieve(&mut self, id: RequestId) -> Result<Option<Outcome>, EngineError> {
        let key = self.table.key(id)?;
        let State { pool, table, .. } = self;
        let Some(request) = table.by_key_mut(key) else {
            return Err(EngineError::NotFound(id));
        };

        let outcome = match request.state {
            RequestState::Queued | RequestState::Submitted => return Ok(None),
            RequestState::Completed => {
                let output = match request.kind {
                    OpKind::Read => Output::Read(unsafe { request.span.to_bytes(pool) }),
                    OpKind::Write => Output::Written(request.len),
                };
                Outcome::Completed(output)
            }
            RequestState::Failed(kind) => Outcome::Failed(kind),
            RequestState::Cancelled => Outcome::Failed(ErrorKind::Cancelled),
        };

        if request.in_kernel {
            // Removed when the late completion arrives.
            request.acknowledged = true;
        } else {
            release_span(pool, request);
            table.remove(key);
        }
        Ok(Some(outcome))
    }

    /// Force every non-terminal request to `Failed(Cancelled)`.
    ///
    /// Requests still owned by the kernel keep their slots and are queued for
    /// kernel cancellation. Returns how many requests were forced.
    pub(crate) fn force_cancel(&mut self) -> usize {
        let State {
            pool,
            table,
            queue,
            retries,
            cancels,
            stats,
            ..
        } = self;

        let mut forced = 0;
        for (key, request) in table.iter_mut() {
            if !request.transition(RequestState::Failed(ErrorKind::Cancelled)) {
                continue;
            }
            forced += 1;
            if request.in_kernel {
                cancels.push(key);
            } else {
                release_span(pool, request);
            }
        }
        queue.clear();
        retries.clear();

        stats.forced += forced as u64;
        stats.failed += forced as u64;
        forced
    }
}

/// Release a request's slots, treating an ownership violation as fatal.
pub(crate) fn release_span(pool: &mut BufferPool, request: &mut Request) {
    if let Err(e) = request.span.release(pool, request.id) {
        error!(request = %request.id, error = %e, "Buffer slot ownership violated");
        panic!("buffer slot ownership violated for request {}: {e}", request.id);
    }
}

/// State plus the synchronization around it.
pub(crate) struct Shared {
    state: Mutex<State>,
    /// Signalled whenever requests reach a terminal state.
    pub(crate) done: Condvar,
    /// Wakes the driver out of a blocking wait.
    pub(crate) notify: Arc<dyn Notify>,
}

impl Shared {
    pub(crate) fn new(state: State, notify: Arc<dyn Notify>) -> Self {
        Self {
            state: Mutex::new(state),
            done: Condvar::new(),
            notify,
        }
    }

    /// Lock the state, ignoring poison.
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
