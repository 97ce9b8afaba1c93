//! Engine driver.
//!
//! A single thread owns the ring. Each turn it moves queued work into the
//! ring, blocks until the kernel completes something (or a caller wakes it),
//! applies up to `batch_size` completions and wakes waiting callers.
//!
//! On shutdown the driver keeps turning until every accepted request is
//! terminal or the drain deadline passes, then tears down: outstanding
//! requests are failed, in-kernel operations are cancelled, and the buffer
//! pool is leaked if the kernel does not give its buffers back in time.

use crate::runtime::reap;
use crate::runtime::ring::{Cqe, Ring};
use crate::runtime::state::{Phase, Shared};
use crate::runtime::submit;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long teardown waits for the kernel to acknowledge cancellations.
const CANCEL_GRACE: Duration = Duration::from_secs(1);

pub(crate) fn spawn(
    shared: Arc<Shared>,
    ring: Box<dyn Ring>,
    batch_size: usize,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("io-driver".to_string())
        .spawn(move || {
            let mut driver = Driver {
                shared,
                ring,
                batch_size,
                cqes: Vec::with_capacity(batch_size),
            };
            if let Err(e) = driver.run() {
                error!(backend = driver.ring.name(), error = %e, "Driver failed");
            }
            driver.teardown();
        })
}

struct Driver {
    shared: Arc<Shared>,
    ring: Box<dyn Ring>,
    batch_size: usize,
    cqes: Vec<Cqe>,
}

impl Driver {
    fn run(&mut self) -> io::Result<()> {
        debug!(backend = self.ring.name(), "Driver started");

        loop {
            let timeout = {
                let mut state = self.shared.lock();
                submit::pump(&mut state, &mut *self.ring)?;

                match state.phase {
                    Phase::Running => None,
                    Phase::Draining { deadline } => {
                        if state.table.active() == 0 {
                            debug!("Drain complete");
                            return Ok(());
                        }
                        match deadline {
                            Some(deadline) => {
                                let now = Instant::now();
                                if now >= deadline {
                                    let forced = state.force_cancel();
                                    warn!(forced, "Shutdown timed out, cancelling outstanding requests");
                                    return Ok(());
                                }
                                Some(deadline - now)
                            }
                            None => None,
                        }
                    }
                    Phase::Stopped => return Ok(()),
                }
            };

            reap::drain(
                &mut *self.ring,
                &mut self.cqes,
                true,
                timeout,
                self.batch_size,
            )?;
            self.apply();
        }
    }

    /// Apply reaped completions and wake callers if anything finished.
    fn apply(&mut self) {
        if self.cqes.is_empty() {
            return;
        }
        let mut finished = 0;
        {
            let mut state = self.shared.lock();
            for cqe in self.cqes.drain(..) {
                if reap::complete(&mut state, cqe).is_terminal() {
                    finished += 1;
                }
            }
        }
        if finished > 0 {
            self.shared.done.notify_all();
        }
    }

    fn teardown(&mut self) {
        {
            let mut state = self.shared.lock();
            let forced = state.force_cancel();
            if forced > 0 {
                warn!(forced, "Failing requests still outstanding at shutdown");
            }
            let in_kernel: Vec<usize> = state
                .table
                .iter()
                .filter(|(_, r)| r.in_kernel)
                .map(|(key, _)| key)
                .collect();
            state.cancels = in_kernel;
        }
        self.shared.done.notify_all();

        let deadline = Instant::now() + CANCEL_GRACE;
        loop {
            let timeout = {
                let mut state = self.shared.lock();
                if let Err(e) = submit::push_cancels(&mut state, &mut *self.ring) {
                    warn!(error = %e, "Failed to submit cancellations");
                }
                let in_kernel = state.table.in_kernel();
                if in_kernel == 0 {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    warn!(in_kernel, "Kernel still holds buffers, leaking buffer pool");
                    state.pool.leak();
                    break;
                }
                deadline - now
            };

            let drained = reap::drain(
                &mut *self.ring,
                &mut self.cqes,
                true,
                Some(timeout),
                self.batch_size,
            );
            if let Err(e) = drained {
                let mut state = self.shared.lock();
                error!(error = %e, "Ring failed during teardown, leaking buffer pool");
                state.pool.leak();
                break;
            }
            self.apply();
        }

        let stats = {
            let mut state = self.shared.lock();
            state.phase = Phase::Stopped;
            state.stats()
        };
        self.shared.done.notify_all();

        info!(
            backend = self.ring.name(),
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            forced = stats.forced,
            "Driver stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::blocking::BlockingRing;
    use crate::runtime::buffer::BufferPool;
    use crate::runtime::request::{Op, RequestState};
    use crate::runtime::state::State;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    fn start(ring_depth: usize, count: usize, size: usize) -> (Arc<Shared>, JoinHandle<()>) {
        let ring = BlockingRing::new(ring_depth * 2 + 1, None);
        let state = State::new(BufferPool::new(count, size, 64).unwrap(), ring_depth);
        let shared = Arc::new(Shared::new(state, ring.notifier()));
        let handle = spawn(shared.clone(), Box::new(ring), 16).unwrap();
        (shared, handle)
    }

    fn stop(shared: &Shared, handle: JoinHandle<()>, deadline: Option<Instant>) {
        shared.lock().phase = Phase::Draining { deadline };
        shared.notify.notify();
        handle.join().unwrap();
        assert_eq!(shared.lock().phase, Phase::Stopped);
    }

    #[test]
    fn test_driver_completes_enqueued_work() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[5u8; 1024]).unwrap();
        let (shared, handle) = start(2, 8, 128);

        let ids: Vec<_> = {
            let mut state = shared.lock();
            (0..8)
                .map(|i| submit::enqueue(&mut state, Op::read(file.as_raw_fd(), i * 128, 128)).unwrap())
                .collect()
        };
        shared.notify.notify();

        let mut state = shared.lock();
        while ids
            .iter()
            .any(|&id| !state.table.get(id).unwrap().state().is_terminal())
        {
            state = shared
                .done
                .wait_timeout(state, Duration::from_secs(5))
                .unwrap()
                .0;
        }
        assert!(ids
            .iter()
            .all(|&id| state.table.get(id).unwrap().state() == RequestState::Completed));
        assert!(state.stats.in_flight_high_water <= 2);
        drop(state);

        stop(&shared, handle, None);
    }

    #[test]
    fn test_drain_finishes_queued_work() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1u8; 256]).unwrap();
        let (shared, handle) = start(1, 4, 64);

        let ids: Vec<_> = {
            let mut state = shared.lock();
            let ids = (0..4)
                .map(|i| submit::enqueue(&mut state, Op::read(file.as_raw_fd(), i * 64, 64)).unwrap())
                .collect();
            state.phase = Phase::Draining { deadline: None };
            ids
        };
        shared.notify.notify();
        handle.join().unwrap();

        let state = shared.lock();
        assert_eq!(state.phase, Phase::Stopped);
        for id in ids {
            assert_eq!(state.table.get(id).unwrap().state(), RequestState::Completed);
        }
        assert_eq!(state.stats.forced, 0);
    }

    #[test]
    fn test_idle_driver_stops() {
        let (shared, handle) = start(4, 4, 64);
        stop(&shared, handle, Some(Instant::now()));
        assert_eq!(shared.lock().stats().in_flight, 0);
    }
}
