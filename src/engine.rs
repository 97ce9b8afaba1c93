//! Engine facade.
//!
//! [`Engine`] is the thread-safe handle callers use. It owns the driver
//! thread and the shared state; every method takes `&self` and may be called
//! from any number of threads.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::runtime::state::{Phase, Shared, State};
use crate::runtime::{
    driver, open_ring, submit, BufferPool, CancelOutcome, EngineStats, Op, Outcome, Output,
    RequestId,
};
use bytes::Bytes;
use std::collections::VecDeque;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Batched file I/O engine.
pub struct Engine {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    config: EngineConfig,
}

/// Summary returned by [`Engine::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Requests forced to `Failed(Cancelled)` because the drain timed out.
    pub forced: u64,
    /// The kernel kept buffers past teardown, so the slot region was leaked.
    pub leaked_buffers: bool,
    pub stats: EngineStats,
}

impl Engine {
    /// Allocate the buffer pool, open the ring and start the driver thread.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let pool = BufferPool::new(config.buffer_count, config.buffer_size, config.buffer_align)?;
        let ring = open_ring(&config)?;
        let backend = ring.name();

        let shared = Arc::new(Shared::new(
            State::new(pool, config.ring_depth),
            ring.notifier(),
        ));
        let handle = driver::spawn(shared.clone(), ring, config.batch_size)?;

        info!(
            backend,
            ring_depth = config.ring_depth,
            buffer_count = config.buffer_count,
            buffer_size = config.buffer_size,
            "Engine started"
        );

        Ok(Self {
            shared,
            driver: Mutex::new(Some(handle)),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Enqueue an operation. Never blocks on I/O.
    ///
    /// Returns `Backpressure` when the buffer slots it needs are taken; retry
    /// after retrieving some results.
    pub fn submit(&self, op: Op) -> Result<RequestId, EngineError> {
        let id = submit::enqueue(&mut self.shared.lock(), op)?;
        self.shared.notify.notify();
        Ok(id)
    }

    /// Read `len` bytes at `offset`.
    pub fn read(&self, fd: RawFd, offset: u64, len: usize) -> Result<RequestId, EngineError> {
        self.submit(Op::read(fd, offset, len))
    }

    /// Write `data` at `offset`.
    pub fn write(
        &self,
        fd: RawFd,
        offset: u64,
        data: impl Into<Bytes>,
    ) -> Result<RequestId, EngineError> {
        self.submit(Op::write(fd, offset, data))
    }

    /// Non-blocking status check.
    ///
    /// Returns `None` while the request is in progress. A terminal outcome is
    /// returned exactly once; later polls of the same id are `NotFound`.
    pub fn poll(&self, id: RequestId) -> Result<Option<Outcome>, EngineError> {
        self.shared.lock().retrieve(id)
    }

    /// Block until `id` is terminal or `timeout` elapses.
    pub fn wait(&self, id: RequestId, timeout: Option<Duration>) -> Result<Outcome, EngineError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();

        loop {
            if let Some(outcome) = state.retrieve(id)? {
                return Ok(outcome);
            }
            state = match deadline {
                None => self
                    .shared
                    .done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(EngineError::TimedOut);
                    }
                    self.shared
                        .done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Cancel a request.
    ///
    /// Queued requests never reach the kernel. For submitted requests the
    /// kernel operation is cancelled best-effort; either way the request
    /// reports `Failed(Cancelled)` from now on.
    pub fn cancel(&self, id: RequestId) -> Result<CancelOutcome, EngineError> {
        let (outcome, wake_driver) = {
            let mut state = self.shared.lock();
            let outcome = submit::cancel(&mut state, id)?;
            (outcome, !state.cancels.is_empty())
        };
        if outcome == CancelOutcome::Cancelled {
            self.shared.done.notify_all();
        }
        if wake_driver {
            self.shared.notify.notify();
        }
        Ok(outcome)
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.lock().stats()
    }

    /// Stop accepting work and drain.
    ///
    /// Accepted requests keep running until they are terminal or `timeout`
    /// elapses, after which the rest are failed with `Cancelled`. Blocks until
    /// the driver has stopped. Results not yet retrieved stay retrievable
    /// until the engine is dropped. Later calls only report.
    pub fn shutdown(&self, timeout: Option<Duration>) -> ShutdownReport {
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            {
                let mut state = self.shared.lock();
                if state.phase == Phase::Running {
                    let deadline = timeout.map(|t| Instant::now() + t);
                    state.phase = Phase::Draining { deadline };
                    debug!(timeout_ms = ?timeout.map(|t| t.as_millis()), "Draining");
                }
            }
            self.shared.notify.notify();

            if handle.join().is_err() {
                error!("Driver thread panicked");
                let mut state = self.shared.lock();
                state.force_cancel();
                if state.table.in_kernel() > 0 {
                    state.pool.leak();
                }
                state.phase = Phase::Stopped;
                drop(state);
                self.shared.done.notify_all();
            }
        }

        let state = self.shared.lock();
        ShutdownReport {
            forced: state.stats.forced,
            leaked_buffers: state.pool.is_leaked(),
            stats: state.stats(),
        }
    }

    /// Read many ranges of `fd`, returning outcomes in input order.
    ///
    /// Keeps as many reads outstanding as the buffer pool allows; on
    /// `Backpressure` it waits for the oldest outstanding read. Empty ranges
    /// complete with no bytes and are never submitted. If the pool
    /// cannot fit the next range even with nothing outstanding, the
    /// `Backpressure` is returned. On any error, reads already issued are
    /// cancelled and discarded.
    pub fn read_ranges(
        &self,
        fd: RawFd,
        ranges: &[Range<u64>],
    ) -> Result<Vec<Outcome>, EngineError> {
        let mut results: Vec<Option<Outcome>> = vec![None; ranges.len()];
        let mut pending: VecDeque<(usize, RequestId)> = VecDeque::new();

        for (i, range) in ranges.iter().enumerate() {
            let len = range
                .end
                .checked_sub(range.start)
                .and_then(|len| usize::try_from(len).ok())
                .ok_or(EngineError::InvalidRequest("range end precedes start"));
            let len = match len {
                Ok(0) => {
                    results[i] = Some(Outcome::Completed(Output::Read(Bytes::new())));
                    continue;
                }
                Ok(len) => len,
                Err(e) => {
                    self.abandon(&mut pending);
                    return Err(e);
                }
            };

            loop {
                match self.read(fd, range.start, len) {
                    Ok(id) => {
                        pending.push_back((i, id));
                        break;
                    }
                    Err(EngineError::Backpressure) if !pending.is_empty() => {
                        let Some((j, oldest)) = pending.pop_front() else {
                            break;
                        };
                        match self.wait(oldest, None) {
                            Ok(outcome) => results[j] = Some(outcome),
                            Err(e) => {
                                self.abandon(&mut pending);
                                return Err(e);
                            }
                        }
                    }
                    Err(e) => {
                        self.abandon(&mut pending);
                        return Err(e);
                    }
                }
            }
        }

        while let Some((j, id)) = pending.pop_front() {
            match self.wait(id, None) {
                Ok(outcome) => results[j] = Some(outcome),
                Err(e) => {
                    self.abandon(&mut pending);
                    return Err(e);
                }
            }
        }

        let outcomes: Vec<Outcome> = results.into_iter().flatten().collect();
        debug_assert_eq!(outcomes.len(), ranges.len());
        Ok(outcomes)
    }

    /// Cancel and retrieve requests whose results nobody will collect.
    fn abandon(&self, pending: &mut VecDeque<(usize, RequestId)>) {
        for (_, id) in pending.drain(..) {
            match self.cancel(id) {
                Ok(_) | Err(EngineError::NotFound(_)) => {}
                Err(e) => debug!(request = %id, error = %e, "Failed to cancel abandoned request"),
            }
            match self.poll(id) {
                Ok(_) | Err(EngineError::NotFound(_)) => {}
                Err(e) => debug!(request = %id, error = %e, "Failed to discard abandoned request"),
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let report = self.shutdown(self.config.shutdown_timeout());
        if report.forced > 0 || report.leaked_buffers {
            debug!(
                forced = report.forced,
                leaked_buffers = report.leaked_buffers,
                "Engine dropped with outstanding work"
            );
        }
    }
}
