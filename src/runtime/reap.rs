//! Completion reaper.
//!
//! Drains kernel completions and applies them to the request table. A
//! completion that moved fewer bytes than remain is not surfaced: the request
//! goes back to the driver as a follow-up for the remaining range, so the
//! caller only ever sees the full range or an explicit failure.

use crate::error::ErrorKind;
use crate::runtime::request::{OpKind, RequestId, RequestState};
use crate::runtime::ring::{Cqe, Ring};
use crate::runtime::state::{release_span, State};
use crate::runtime::token::Token;
use std::io;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// What a single completion did to the request table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reaped {
    Completed(RequestId),
    Failed(RequestId, ErrorKind),
    /// Short or interrupted transfer; a follow-up was scheduled.
    Retry(RequestId),
    /// Completion for a request that was already terminal.
    Late(RequestId),
    /// Cancellation acks and unknown tokens.
    Ignored,
}

impl Reaped {
    /// Whether a request reached a terminal state.
    pub(crate) fn is_terminal(self) -> bool {
        matches!(self, Reaped::Completed(_) | Reaped::Failed(..))
    }
}

/// Collect up to `max` completions into `cqes`.
///
/// With `block` set, waits (up to `timeout`) for at least one completion or
/// a notification first. Either way queued submissions are flushed.
pub(crate) fn drain(
    ring: &mut dyn Ring,
    cqes: &mut Vec<Cqe>,
    block: bool,
    timeout: Option<Duration>,
    max: usize,
) -> io::Result<usize> {
    if block {
        ring.wait(timeout)?;
    } else {
        ring.submit()?;
    }
    let before = cqes.len();
    ring.reap(cqes, max);
    Ok(cqes.len() - before)
}

/// Apply one completion.
pub(crate) fn complete(state: &mut State, cqe: Cqe) -> Reaped {
    let key = match Token::decode(cqe.token) {
        Some(Token::Io { key }) => key,
        Some(Token::Cancel { key }) => {
            trace!(key, result = cqe.result, "Cancellation acknowledged");
            return Reaped::Ignored;
        }
        Some(Token::Wake) => return Reaped::Ignored,
        None => {
            warn!(token = cqe.token, "Completion with unknown token");
            return Reaped::Ignored;
        }
    };

    let State {
        pool,
        table,
        retries,
        in_flight,
        stats,
        ..
    } = state;
    let Some(request) = table.by_key_mut(key) else {
        warn!(key, "Completion for unknown request");
        return Reaped::Ignored;
    };
    if !request.in_kernel {
        warn!(request = %request.id, "Completion for request not in the kernel");
        return Reaped::Ignored;
    }

    request.in_kernel = false;
    request.iov.0.clear();
    *in_flight -= 1;
    let id = request.id;

    if request.state.is_terminal() {
        // Cancelled or forced while the kernel held the buffers.
        trace!(request = %id, result = cqe.result, "Late completion");
        release_span(pool, request);
        if request.acknowledged {
            table.remove(key);
        }
        return Reaped::Late(id);
    }

    let kind = match cqe.result {
        n if n > 0 => {
            request.transferred += n as usize;
            if request.transferred < request.len {
                trace!(
                    request = %id,
                    transferred = request.transferred,
                    len = request.len,
                    "Short transfer"
                );
                retries.push_back(key);
                stats.short_io_retries += 1;
                return Reaped::Retry(id);
            }
            request.transition(RequestState::Completed);
            stats.completed += 1;
            trace!(request = %id, "Completed");
            return Reaped::Completed(id);
        }
        0 => match request.kind {
            OpKind::Read => ErrorKind::UnexpectedEof,
            OpKind::Write => ErrorKind::WriteZero,
        },
        n if -n == libc::EINTR || -n == libc::EAGAIN => {
            retries.push_back(key);
            stats.short_io_retries += 1;
            return Reaped::Retry(id);
        }
        n => ErrorKind::Kernel(-n),
    };

    request.transition(RequestState::Failed(kind));
    release_span(pool, request);
    stats.failed += 1;
    debug!(request = %id, error = %kind, "Failed");
    Reaped::Failed(id, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::blocking::BlockingRing;
    use crate::runtime::buffer::BufferPool;
    use crate::runtime::request::{Op, Outcome, Output};
    use crate::runtime::submit::{cancel, enqueue, pump};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;

    fn state(ring_depth: usize, count: usize, size: usize) -> State {
        State::new(BufferPool::new(count, size, 64).unwrap(), ring_depth)
    }

    /// Pump and reap until nothing is left in flight.
    fn run(state: &mut State, ring: &mut BlockingRing) -> Vec<Reaped> {
        let mut reaped = Vec::new();
        let mut cqes = Vec::new();
        loop {
            pump(state, ring).unwrap();
            if state.in_flight == 0 && state.retries.is_empty() && state.queue.is_empty() {
                break;
            }
            drain(ring, &mut cqes, false, None, 64).unwrap();
            for cqe in cqes.drain(..) {
                reaped.push(complete(state, cqe));
            }
        }
        reaped
    }

    #[test]
    fn test_short_read_is_retried_until_complete() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&data).unwrap();

        let mut state = state(4, 4, 4096);
        let mut ring = BlockingRing::new(8, Some(4096));
        let id = enqueue(&mut state, Op::read(file.as_raw_fd(), 0, 10_000)).unwrap();

        let reaped = run(&mut state, &mut ring);
        assert_eq!(
            reaped,
            vec![Reaped::Retry(id), Reaped::Retry(id), Reaped::Completed(id)]
        );
        assert_eq!(state.stats.short_io_retries, 2);

        let outcome = state.retrieve(id).unwrap().unwrap();
        assert_eq!(outcome.into_bytes().unwrap(), &data[..]);
        assert_eq!(state.pool.available(), 4);
        assert!(state.table.is_empty());
    }

    #[test]
    fn test_eof_fails_instead_of_partial_result() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1u8; 100]).unwrap();

        let mut state = state(4, 2, 256);
        let mut ring = BlockingRing::new(8, None);
        let id = enqueue(&mut state, Op::read(file.as_raw_fd(), 0, 200)).unwrap();

        let reaped = run(&mut state, &mut ring);
        assert_eq!(
            reaped,
            vec![
                Reaped::Retry(id),
                Reaped::Failed(id, ErrorKind::UnexpectedEof)
            ]
        );
        // Failure gives the slot back at once.
        assert_eq!(state.pool.available(), 2);
        assert_eq!(
            state.retrieve(id).unwrap(),
            Some(Outcome::Failed(ErrorKind::UnexpectedEof))
        );
    }

    #[test]
    fn test_kernel_error_is_surfaced() {
        let mut state = state(4, 2, 64);
        let mut ring = BlockingRing::new(8, None);
        let id = enqueue(&mut state, Op::read(-1, 0, 64)).unwrap();

        let reaped = run(&mut state, &mut ring);
        assert_eq!(
            reaped,
            vec![Reaped::Failed(id, ErrorKind::Kernel(libc::EBADF))]
        );
        assert_eq!(state.stats.failed, 1);
    }

    #[test]
    fn test_write_spanning_slots() {
        let file = tempfile::tempfile().unwrap();
        let payload: Vec<u8> = (0..300u32).map(|i| i as u8).collect();

        let mut state = state(2, 4, 128);
        let mut ring = BlockingRing::new(8, Some(100));
        let id = enqueue(&mut state, Op::write(file.as_raw_fd(), 10, payload.clone())).unwrap();

        let reaped = run(&mut state, &mut ring);
        assert_eq!(reaped.last(), Some(&Reaped::Completed(id)));
        assert_eq!(
            state.retrieve(id).unwrap(),
            Some(Outcome::Completed(Output::Written(300)))
        );

        let id = enqueue(&mut state, Op::read(file.as_raw_fd(), 10, 300)).unwrap();
        run(&mut state, &mut ring);
        let bytes = state.retrieve(id).unwrap().unwrap().into_bytes().unwrap();
        assert_eq!(bytes, &payload[..]);
    }

    #[test]
    fn test_late_completion_after_cancel_is_noop() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[9u8; 64]).unwrap();

        let mut state = state(4, 1, 64);
        let mut ring = BlockingRing::new(8, None);
        let id = enqueue(&mut state, Op::read(file.as_raw_fd(), 0, 64)).unwrap();
        pump(&mut state, &mut ring).unwrap();
        cancel(&mut state, id).unwrap();

        // Retrieving while the kernel holds the slot acknowledges the entry.
        assert_eq!(
            state.retrieve(id).unwrap(),
            Some(Outcome::Failed(ErrorKind::Cancelled))
        );
        assert_eq!(state.table.len(), 1);

        let reaped = run(&mut state, &mut ring);
        assert!(reaped.contains(&Reaped::Late(id)));
        assert!(!reaped.iter().any(|r| r.is_terminal()));
        assert!(state.table.is_empty());
        assert_eq!(state.pool.available(), 1);
    }

    #[test]
    fn test_unknown_tokens_are_ignored() {
        let mut state = state(1, 1, 64);
        let cqe = Cqe {
            token: Token::Io { key: 42 }.encode(),
            result: 64,
        };
        assert_eq!(complete(&mut state, cqe), Reaped::Ignored);
        assert_eq!(
            complete(&mut state, Cqe { token: u64::MAX, result: 0 }),
            Reaped::Ignored
        );
    }
}
