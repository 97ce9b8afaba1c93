//! io_uring ring backend.
//!
//! Completion-based: entries are pushed to the submission queue, handed to
//! the kernel in batches, and their completions drained from the completion
//! queue. Single-iovec ranges use `Read`/`Write`; spans use `Readv`/`Writev`.
//!
//! Callers wake a blocked driver through an eventfd. A read on that eventfd
//! is kept armed in the ring at all times, so a notification surfaces as a
//! completion and `submit_and_wait` returns.

use crate::runtime::request::OpKind;
use crate::runtime::ring::{Cqe, Notify, Ring, RingFull, Sqe, SqeBody};
use crate::runtime::token::Token;
use io_uring::{opcode, squeue, types, IoUring};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

/// Wake-up channel backed by an eventfd.
struct EventFd {
    fd: RawFd,
}

impl EventFd {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }
}

impl Notify for EventFd {
    fn notify(&self) {
        let one: u64 = 1;
        let n = unsafe { libc::write(self.fd, (&one as *const u64).cast(), 8) };
        if n < 0 {
            // Counter saturated: a wake-up is already pending.
            trace!(error = %io::Error::last_os_error(), "eventfd write failed");
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

pub(crate) struct UringRing {
    // Dropped first: closing the ring retires the armed eventfd read before
    // its buffer and descriptor go away.
    ring: IoUring,
    notify: Arc<EventFd>,
    /// Target of the armed eventfd read.
    wake_buf: Box<u64>,
}

impl UringRing {
    /// Create a ring with `entries` submission slots.
    pub(crate) fn new(entries: u32, sqpoll_idle_ms: Option<u32>) -> io::Result<Self> {
        let mut builder = IoUring::builder();
        if let Some(idle) = sqpoll_idle_ms {
            builder.setup_sqpoll(idle);
        }
        let ring = builder.build(entries)?;

        let mut uring = Self {
            ring,
            notify: Arc::new(EventFd::new()?),
            wake_buf: Box::new(0),
        };
        uring.arm_wake()?;
        uring.ring.submit()?;

        Ok(uring)
    }

    fn arm_wake(&mut self) -> io::Result<()> {
        let read = opcode::Read::new(
            types::Fd(self.notify.fd),
            (&mut *self.wake_buf as *mut u64).cast(),
            8,
        )
        .build()
        .user_data(Token::Wake.encode());

        unsafe {
            if self.ring.submission().push(&read).is_err() {
                self.ring.submit()?;
                self.ring.submission().push(&read).map_err(|_| {
                    io::Error::new(io::ErrorKind::Other, "submission queue full")
                })?;
            }
        }
        Ok(())
    }

    fn build_entry(sqe: &Sqe) -> squeue::Entry {
        let entry = match sqe.body {
            SqeBody::Io {
                fd,
                kind,
                offset,
                iov,
                iov_len,
            } => {
                if iov_len == 1 {
                    let v = unsafe { &*iov };
                    match kind {
                        OpKind::Read => {
                            opcode::Read::new(types::Fd(fd), v.iov_base.cast(), v.iov_len as u32)
                                .offset(offset)
                                .build()
                        }
                        OpKind::Write => opcode::Write::new(
                            types::Fd(fd),
                            v.iov_base.cast_const().cast(),
                            v.iov_len as u32,
                        )
                        .offset(offset)
                        .build(),
                    }
                } else {
                    match kind {
                        OpKind::Read => opcode::Readv::new(types::Fd(fd), iov, iov_len)
                            .offset(offset)
                            .build(),
                        OpKind::Write => opcode::Writev::new(types::Fd(fd), iov, iov_len)
                            .offset(offset)
                            .build(),
                    }
                }
            }
            SqeBody::Cancel { target } => opcode::AsyncCancel::new(target).build(),
        };
        entry.user_data(sqe.token)
    }
}

/// Errors from `io_uring_enter` that only mean "nothing to do right now".
fn is_benign(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) | Some(libc::EAGAIN)
    )
}

impl Ring for UringRing {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    unsafe fn push(&mut self, sqe: &Sqe) -> Result<(), RingFull> {
        let entry = Self::build_entry(sqe);
        unsafe { self.ring.submission().push(&entry) }.map_err(|_| RingFull)
    }

    fn submit(&mut self) -> io::Result<usize> {
        match self.ring.submit() {
            Ok(n) => Ok(n),
            Err(e) if is_benign(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        if !self.ring.completion().is_empty() {
            self.submit()?;
            return Ok(());
        }

        let result = match timeout {
            None => self.ring.submit_and_wait(1),
            Some(timeout) => {
                let ts = types::Timespec::new()
                    .sec(timeout.as_secs())
                    .nsec(timeout.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_benign(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn reap(&mut self, out: &mut Vec<Cqe>, max: usize) {
        let mut rearm = false;

        for cqe in self.ring.completion().take(max) {
            if Token::decode(cqe.user_data()) == Some(Token::Wake) {
                rearm = true;
                continue;
            }
            out.push(Cqe {
                token: cqe.user_data(),
                result: cqe.result(),
            });
        }

        if rearm {
            if let Err(e) = self.arm_wake() {
                warn!(error = %e, "Failed to re-arm wake-up read");
            }
        }
    }

    fn notifier(&self) -> Arc<dyn Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    /// io_uring may be unavailable (old kernel, seccomp in containers).
    fn ring_or_skip(entries: u32) -> Option<UringRing> {
        match UringRing::new(entries, None) {
            Ok(ring) => Some(ring),
            Err(e) => {
                eprintln!("skipping: io_uring unavailable: {e}");
                None
            }
        }
    }

    #[test]
    fn test_read_and_wake() {
        let Some(mut ring) = ring_or_skip(8) else {
            return;
        };

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"uring data").unwrap();

        let mut buf = [0u8; 5];
        let iov = [libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        }];
        let sqe = Sqe {
            token: Token::Io { key: 3 }.encode(),
            body: SqeBody::Io {
                fd: file.as_raw_fd(),
                kind: OpKind::Read,
                offset: 6,
                iov: iov.as_ptr(),
                iov_len: 1,
            },
        };
        unsafe { ring.push(&sqe).unwrap() };

        let mut out = Vec::new();
        while out.is_empty() {
            ring.wait(Some(Duration::from_secs(5))).unwrap();
            ring.reap(&mut out, 8);
        }
        assert_eq!(out[0], Cqe { token: sqe.token, result: 4 });
        assert_eq!(&buf[..4], b"data");

        // A notification wakes the ring without producing a visible completion.
        ring.notifier().notify();
        ring.wait(Some(Duration::from_secs(5))).unwrap();
        out.clear();
        ring.reap(&mut out, 8);
        assert!(out.is_empty());
    }
}
