//! Portable ring backend built on positional syscalls.
//!
//! Same submission/completion contract as io_uring, but entries are executed
//! with `pread`/`pwrite` on the driver thread when they are submitted, and
//! their results are queued as completions. Runs on any Unix, and with
//! `max_transfer` it produces short transfers on demand.

use crate::runtime::request::OpKind;
use crate::runtime::ring::{Cqe, Notify, Ring, RingFull, Sqe, SqeBody};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

/// Condition-variable based wake-up for a driver blocked in `wait`.
#[derive(Default)]
struct CondvarNotify {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Notify for CondvarNotify {
    fn notify(&self) {
        let mut notified = self.notified.lock().unwrap_or_else(PoisonError::into_inner);
        *notified = true;
        self.cond.notify_one();
    }
}

impl CondvarNotify {
    /// Block until notified or `timeout` elapses, consuming the notification.
    fn wait(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut notified = self.notified.lock().unwrap_or_else(PoisonError::into_inner);
        while !*notified {
            match deadline {
                None => {
                    notified = self.cond.wait(notified).unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    notified = self
                        .cond
                        .wait_timeout(notified, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        *notified = false;
    }
}

pub(crate) struct BlockingRing {
    /// Submission queue capacity.
    entries: usize,
    /// Pushed but not yet submitted.
    pending: VecDeque<Sqe>,
    /// Completions waiting to be reaped.
    ready: VecDeque<Cqe>,
    /// Cap on bytes moved per operation.
    max_transfer: Option<usize>,
    notify: Arc<CondvarNotify>,
}

// Safety: pending entries hold raw iovec pointers into the engine's buffer
// pool; the ring is owned and used by the single driver thread.
unsafe impl Send for BlockingRing {}

impl BlockingRing {
    pub(crate) fn new(entries: usize, max_transfer: Option<usize>) -> Self {
        Self {
            entries,
            pending: VecDeque::with_capacity(entries),
            ready: VecDeque::with_capacity(entries * 2),
            max_transfer,
            notify: Arc::new(CondvarNotify::default()),
        }
    }

    fn execute(&self, sqe: &Sqe) -> Cqe {
        let result = match sqe.body {
            SqeBody::Io {
                fd,
                kind,
                offset,
                iov,
                iov_len,
            } => {
                let iov = unsafe { std::slice::from_raw_parts(iov, iov_len as usize) };
                transfer(fd, kind, offset, iov, self.max_transfer)
            }
            // Everything already ran to completion at submit time.
            SqeBody::Cancel { .. } => -libc::ENOENT,
        };
        Cqe {
            token: sqe.token,
            result,
        }
    }
}

/// Vectored positional transfer with `preadv` semantics: returns the bytes
/// moved, or a negated errno if nothing moved.
fn transfer(
    fd: RawFd,
    kind: OpKind,
    offset: u64,
    iov: &[libc::iovec],
    max_transfer: Option<usize>,
) -> i32 {
    let mut budget = max_transfer.unwrap_or(usize::MAX);
    let mut done = 0usize;

    for v in iov {
        if budget == 0 {
            break;
        }
        let want = v.iov_len.min(budget);
        let pos = (offset + done as u64) as libc::off_t;

        let n = loop {
            let n = unsafe {
                match kind {
                    OpKind::Read => libc::pread(fd, v.iov_base, want, pos),
                    OpKind::Write => libc::pwrite(fd, v.iov_base.cast_const(), want, pos),
                }
            };
            if n < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break n;
        };

        if n < 0 {
            if done == 0 {
                let errno = io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO);
                return -errno;
            }
            break;
        }

        let n = n as usize;
        done += n;
        budget -= n;
        if n < want {
            break;
        }
    }

    done.min(i32::MAX as usize) as i32
}

impl Ring for BlockingRing {
    fn name(&self) -> &'static str {
        "blocking"
    }

    unsafe fn push(&mut self, sqe: &Sqe) -> Result<(), RingFull> {
        if self.pending.len() >= self.entries {
            return Err(RingFull);
        }
        self.pending.push_back(*sqe);
        Ok(())
    }

    fn submit(&mut self) -> io::Result<usize> {
        let count = self.pending.len();
        while let Some(sqe) = self.pending.pop_front() {
            let cqe = self.execute(&sqe);
            trace!(token = cqe.token, result = cqe.result, "Executed entry");
            self.ready.push_back(cqe);
        }
        Ok(count)
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.submit()?;
        if self.ready.is_empty() {
            self.notify.wait(timeout);
        }
        Ok(())
    }

    fn reap(&mut self, out: &mut Vec<Cqe>, max: usize) {
        let n = max.min(self.ready.len());
        out.extend(self.ready.drain(..n));
    }

    fn notifier(&self) -> Arc<dyn Notify> {
        self.notify.clone()
    }
}
