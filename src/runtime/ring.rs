//! The kernel ring seam.
//!
//! The driver talks to the kernel only through [`Ring`]. Two backends exist:
//! - `uring` (Linux): real io_uring submission/completion queues.
//! - `blocking` (portable): a submission/completion queue pair serviced with
//!   positional syscalls at submit time.
//!
//! A ring is owned by exactly one driver thread. Other threads interact with
//! it only through the [`Notify`] handle, which wakes a driver blocked in
//! [`Ring::wait`].

use crate::runtime::request::OpKind;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// A submission queue entry.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sqe {
    /// Encoded [`Token`](crate::runtime::token::Token).
    pub(crate) token: u64,
    pub(crate) body: SqeBody,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SqeBody {
    /// Vectored transfer at `offset`.
    ///
    /// `iov` must stay valid, and the memory it describes untouched, until
    /// the matching completion is reaped.
    Io {
        fd: RawFd,
        kind: OpKind,
        offset: u64,
        iov: *const libc::iovec,
        iov_len: u32,
    },
    /// Cancel the in-flight operation carrying `target` as its token.
    Cancel { target: u64 },
}

/// A completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cqe {
    pub(crate) token: u64,
    /// Bytes transferred, or a negated errno.
    pub(crate) result: i32,
}

/// Submission queue has no free entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingFull;

/// Wakes a driver blocked in [`Ring::wait`]. Safe to call from any thread.
pub(crate) trait Notify: Send + Sync {
    fn notify(&self);
}

pub(crate) trait Ring: Send {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Queue an entry without submitting it.
    ///
    /// # Safety
    /// Buffers referenced by `sqe` must remain valid until its completion is
    /// reaped.
    unsafe fn push(&mut self, sqe: &Sqe) -> Result<(), RingFull>;

    /// Hand queued entries to the kernel.
    fn submit(&mut self) -> io::Result<usize>;

    /// Block until at least one completion is ready, the ring is notified,
    /// or `timeout` elapses. Submits queued entries first.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Move up to `max` ready completions into `out`, in kernel order.
    fn reap(&mut self, out: &mut Vec<Cqe>, max: usize);

    /// Handle used by callers to wake the driver.
    fn notifier(&self) -> Arc<dyn Notify>;
}

/// Push an entry, flushing the submission queue once if it is full.
///
/// # Safety
/// Same contract as [`Ring::push`].
pub(crate) unsafe fn push_or_flush(ring: &mut dyn Ring, sqe: &Sqe) -> io::Result<bool> {
    if unsafe { ring.push(sqe) }.is_ok() {
        return Ok(true);
    }
    ring.submit()?;
    Ok(unsafe { ring.push(sqe) }.is_ok())
}
