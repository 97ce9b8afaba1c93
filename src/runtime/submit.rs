//! Submission manager.
//!
//! Turns caller operations into queued requests (caller side) and moves
//! queued requests into the kernel ring (driver side), never letting more
//! than `ring_depth` requests be in flight.
//!
//! Admission is bounded by the buffer pool: if the slots a request needs are
//! not free, `enqueue` returns `Backpressure` instead of queueing unbounded
//! work. A request that gets its slots but finds the ring at capacity waits
//! in a FIFO, so requests reach the kernel in enqueue order.

use crate::error::EngineError;
use crate::runtime::buffer::SlotSpan;
use crate::runtime::request::{
    CancelOutcome, IoVecs, Op, OpKind, Request, RequestId, RequestState,
};
use crate::runtime::ring::{push_or_flush, Ring, Sqe, SqeBody};
use crate::runtime::state::{release_span, Phase, State};
use crate::runtime::token::Token;
use std::io;
use tracing::{debug, trace};

/// Largest transfer a single read/write syscall performs on Linux.
const MAX_RW_COUNT: usize = 0x7fff_f000;

/// Kernel limit on iovecs per vectored operation.
const IOV_MAX: usize = 1024;

/// Validate `op`, give it buffer slots and queue it for submission.
///
/// Runs on the caller's thread. Never blocks.
pub(crate) fn enqueue(state: &mut State, op: Op) -> Result<RequestId, EngineError> {
    if state.phase != Phase::Running {
        return Err(EngineError::ShuttingDown);
    }
    validate(state, &op)?;

    if state.pool.available() < state.pool.slots_for(op.len) {
        trace!(len = op.len, free = state.pool.available(), "Backpressure");
        return Err(EngineError::Backpressure);
    }

    let id = state.table.next_id();
    let span = SlotSpan::acquire(&mut state.pool, op.len, id)
        .map_err(|_| EngineError::Backpressure)?;

    if let Some(data) = &op.data {
        // Nothing else can see the slots until the request is queued.
        unsafe { span.copy_from(&mut state.pool, data) };
    }

    let key = state.table.create(Request::new(id, &op, span));
    state.queue.push_back(key);
    state.stats.enqueued += 1;

    trace!(
        request = %id,
        fd = op.fd,
        kind = ?op.kind,
        offset = op.offset,
        len = op.len,
        "Enqueued"
    );
    Ok(id)
}

fn validate(state: &State, op: &Op) -> Result<(), EngineError> {
    if op.len == 0 {
        return Err(EngineError::InvalidRequest("zero-length request"));
    }
    match (op.kind, &op.data) {
        (OpKind::Read, Some(_)) => {
            return Err(EngineError::InvalidRequest("read carries a payload"));
        }
        (OpKind::Write, None) => {
            return Err(EngineError::InvalidRequest("write without payload"));
        }
        (OpKind::Write, Some(data)) if data.len() != op.len => {
            return Err(EngineError::InvalidRequest("payload length differs from request length"));
        }
        _ => {}
    }
    if op.offset.checked_add(op.len as u64).is_none() {
        return Err(EngineError::InvalidRequest("offset + length overflows"));
    }
    let limit = state.pool.max_request();
    if op.len > limit {
        return Err(EngineError::SizeLimitExceeded {
            requested: op.len,
            limit,
        });
    }
    Ok(())
}

/// Push pending work into the ring, in priority order: cancellations,
/// short-I/O follow-ups, then queued requests in FIFO order while in-flight
/// capacity remains.
///
/// Runs on the driver thread. Returns the number of I/O operations issued.
pub(crate) fn pump(state: &mut State, ring: &mut dyn Ring) -> io::Result<usize> {
    push_cancels(state, ring)?;

    let mut issued = 0;

    // Follow-ups free no capacity: the request was in flight a moment ago.
    while let Some(key) = state.retries.pop_front() {
        if !issue(state, ring, key)? {
            state.retries.push_front(key);
            return Ok(issued);
        }
        issued += 1;
    }

    while state.in_flight < state.ring_depth {
        let Some(key) = state.queue.pop_front() else {
            break;
        };
        if !issue(state, ring, key)? {
            state.queue.push_front(key);
            break;
        }
        issued += 1;
    }

    Ok(issued)
}

/// Submit cancellation entries for requests still owned by the kernel.
pub(crate) fn push_cancels(state: &mut State, ring: &mut dyn Ring) -> io::Result<()> {
    while let Some(key) = state.cancels.pop() {
        let in_kernel = state.table.by_key(key).is_some_and(|r| r.in_kernel);
        if !in_kernel {
            continue;
        }
        let sqe = Sqe {
            token: Token::Cancel { key }.encode(),
            body: SqeBody::Cancel {
                target: Token::Io { key }.encode(),
            },
        };
        if !unsafe { push_or_flush(ring, &sqe)? } {
            state.cancels.push(key);
            break;
        }
    }
    Ok(())
}

/// Hand the untransferred part of a request to the ring.
///
/// This is the Queued -> Submitted transition; from here until the
/// completion is reaped the kernel owns the request's slots.
fn issue(state: &mut State, ring: &mut dyn Ring, key: usize) -> io::Result<bool> {
    let State {
        pool,
        table,
        stats,
        in_flight,
        ..
    } = state;
    let Some(request) = table.by_key_mut(key) else {
        return Ok(true);
    };
    debug_assert!(!request.in_kernel, "request issued twice");

    let mut iov = request.span.iovecs(pool, request.transferred);
    clamp_iovecs(&mut iov, MAX_RW_COUNT, IOV_MAX);
    request.iov = IoVecs(iov);

    let sqe = Sqe {
        token: Token::Io { key }.encode(),
        body: SqeBody::Io {
            fd: request.fd,
            kind: request.kind,
            offset: request.offset + request.transferred as u64,
            iov: request.iov.0.as_ptr(),
            iov_len: request.iov.0.len() as u32,
        },
    };

    // Safety: the iovecs live in the request and point at its slots; both
    // stay put until the completion for this token is reaped.
    if !unsafe { push_or_flush(ring, &sqe)? } {
        request.iov.0.clear();
        return Ok(false);
    }

    request.in_kernel = true;
    if request.state == RequestState::Queued {
        request.transition(RequestState::Submitted);
    }
    *in_flight += 1;
    stats.submitted += 1;
    stats.in_flight_high_water = stats.in_flight_high_water.max(*in_flight);

    trace!(request = %request.id, transferred = request.transferred, "Submitted");
    Ok(true)
}

/// Trim iovecs so the operation moves at most `max_bytes` in at most
/// `max_count` segments. The remainder is picked up as a short transfer.
fn clamp_iovecs(iov: &mut Vec<libc::iovec>, max_bytes: usize, max_count: usize) {
    iov.truncate(max_count);
    let mut budget = max_bytes;
    let mut keep = 0;
    for v in iov.iter_mut() {
        if budget == 0 {
            break;
        }
        v.iov_len = v.iov_len.min(budget);
        budget -= v.iov_len;
        keep += 1;
    }
    iov.truncate(keep);
}

/// Cancel a request on behalf of a caller.
///
/// Queued requests are pulled from the FIFO and release their slots at once.
/// Submitted requests become `Cancelled` immediately; the kernel operation is
/// cancelled best-effort and its slots come back when its completion lands.
pub(crate) fn cancel(state: &mut State, id: RequestId) -> Result<CancelOutcome, EngineError> {
    let key = state.table.key(id)?;
    let State {
        pool,
        table,
        queue,
        retries,
        cancels,
        stats,
        ..
    } = state;
    let Some(request) = table.by_key_mut(key) else {
        return Err(EngineError::NotFound(id));
    };

    match request.state {
        RequestState::Queued => {
            request.transition(RequestState::Cancelled);
            queue.retain(|&k| k != key);
            release_span(pool, request);
        }
        RequestState::Submitted => {
            request.transition(RequestState::Cancelled);
            if request.in_kernel {
                cancels.push(key);
            } else {
                retries.retain(|&k| k != key);
                release_span(pool, request);
            }
        }
        _ => return Ok(CancelOutcome::AlreadyTerminal),
    }

    stats.cancelled += 1;
    debug!(request = %id, "Cancelled");
    Ok(CancelOutcome::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::runtime::blocking::BlockingRing;
    use crate::runtime::buffer::BufferPool;
    use crate::runtime::request::Outcome;
    use crate::runtime::ring::Cqe;
    use std::collections::HashSet;

    fn state(ring_depth: usize, count: usize, size: usize) -> State {
        State::new(BufferPool::new(count, size, 64).unwrap(), ring_depth)
    }

    #[test]
    fn test_backpressure_when_slots_exhausted() {
        let mut state = state(4, 4, 4096);
        for i in 0..4 {
            enqueue(&mut state, Op::read(0, i * 4096, 4096)).unwrap();
        }
        assert!(matches!(
            enqueue(&mut state, Op::read(0, 4 * 4096, 4096)),
            Err(EngineError::Backpressure)
        ));
        assert_eq!(state.queue.len(), 4);
    }

    #[test]
    fn test_validation() {
        let mut state = state(4, 2, 1024);
        assert!(matches!(
            enqueue(&mut state, Op::read(0, 0, 0)),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            enqueue(&mut state, Op::read(0, 0, 4096)),
            Err(EngineError::SizeLimitExceeded {
                requested: 4096,
                limit: 2048
            })
        ));
        let mut bad = Op::write(0, 0, vec![1u8; 8]);
        bad.len = 4;
        assert!(matches!(
            enqueue(&mut state, bad),
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(matches!(
            enqueue(&mut state, Op::read(0, u64::MAX, 2)),
            Err(EngineError::InvalidRequest(_))
        ));
        // Failed validation takes no slots.
        assert_eq!(state.pool.available(), 2);
    }

    #[test]
    fn test_pump_respects_ring_depth_and_fifo() {
        let mut state = state(2, 4, 64);
        let mut ring = BlockingRing::new(8, None);
        let ids: Vec<_> = (0..4)
            .map(|i| enqueue(&mut state, Op::read(-1, i * 64, 64)).unwrap())
            .collect();

        assert_eq!(pump(&mut state, &mut ring).unwrap(), 2);
        assert_eq!(state.in_flight, 2);
        assert_eq!(state.queue.len(), 2);

        let states: Vec<_> = ids
            .iter()
            .map(|&id| state.table.get(id).unwrap().state())
            .collect();
        assert_eq!(
            states,
            vec![
                RequestState::Submitted,
                RequestState::Submitted,
                RequestState::Queued,
                RequestState::Queued
            ]
        );

        // At capacity nothing more goes out.
        assert_eq!(pump(&mut state, &mut ring).unwrap(), 0);
        assert!(state.stats.in_flight_high_water <= 2);
    }

    #[test]
    fn test_cancel_queued_never_completes() {
        let mut state = state(1, 2, 64);
        let mut ring = BlockingRing::new(8, None);
        let first = enqueue(&mut state, Op::read(-1, 0, 64)).unwrap();
        let second = enqueue(&mut state, Op::read(-1, 64, 64)).unwrap();
        pump(&mut state, &mut ring).unwrap();

        assert_eq!(cancel(&mut state, second).unwrap(), CancelOutcome::Cancelled);
        assert!(state.queue.is_empty());
        assert_eq!(state.pool.available(), 1);

        // Capacity frees up; the cancelled request must not be issued.
        state.in_flight = 0;
        state.table.by_key_mut(state.table.key(first).unwrap()).unwrap().in_kernel = false;
        assert_eq!(pump(&mut state, &mut ring).unwrap(), 0);

        assert_eq!(
            state.retrieve(second).unwrap(),
            Some(Outcome::Failed(ErrorKind::Cancelled))
        );
        assert!(matches!(
            cancel(&mut state, second),
            Err(EngineError::NotFound(id)) if id == second
        ));
    }

    #[test]
    fn test_cancel_submitted_defers_slot_release() {
        let mut state = state(4, 2, 64);
        let mut ring = BlockingRing::new(8, None);
        let id = enqueue(&mut state, Op::read(-1, 0, 64)).unwrap();
        pump(&mut state, &mut ring).unwrap();

        assert_eq!(cancel(&mut state, id).unwrap(), CancelOutcome::Cancelled);
        assert_eq!(cancel(&mut state, id).unwrap(), CancelOutcome::AlreadyTerminal);

        // The kernel still owns the slot until the cancellation is pushed and
        // the original completion is reaped.
        assert_eq!(state.pool.available(), 1);
        assert_eq!(state.cancels.len(), 1);
        push_cancels(&mut state, &mut ring).unwrap();
        assert!(state.cancels.is_empty());

        let mut cqes: Vec<Cqe> = Vec::new();
        ring.submit().unwrap();
        ring.reap(&mut cqes, 16);
        assert_eq!(cqes.len(), 2);
    }

    #[test]
    fn test_slot_ownership_is_exclusive() {
        let mut state = state(8, 12, 32);
        for i in 0..3 {
            enqueue(&mut state, Op::read(-1, i * 100, 70)).unwrap();
        }
        let mut seen = HashSet::new();
        for (_, request) in state.table.iter() {
            for &slot in request.span.slots() {
                assert!(seen.insert(slot), "{slot} shared by two requests");
                assert_eq!(state.pool.owner(slot), Some(request.id()));
            }
        }
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_clamp_iovecs() {
        let mut buf = [0u8; 300];
        let mut iov: Vec<libc::iovec> = buf
            .chunks_mut(100)
            .map(|c| libc::iovec {
                iov_base: c.as_mut_ptr().cast(),
                iov_len: c.len(),
            })
            .collect();

        clamp_iovecs(&mut iov, 150, 8);
        assert_eq!(iov.iter().map(|v| v.iov_len).collect::<Vec<_>>(), vec![100, 50]);

        clamp_iovecs(&mut iov, 1000, 1);
        assert_eq!(iov.len(), 1);
    }
}
