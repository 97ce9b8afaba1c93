//! Engine runtime.
//!
//! Platform-specific ring backends:
//! - Linux: io_uring for completion-based I/O
//! - Any Unix: a blocking backend built on `pread`/`pwrite`
//!
//! Both sit behind the `Ring` seam and share common machinery:
//! - `BufferPool`: fixed slots handed to requests for their lifetime
//! - `RequestTable`: request lifecycle tracking
//! - `Token`: operation tracking for completion correlation

mod blocking;
pub mod buffer;
pub(crate) mod driver;
mod reap;
pub mod request;
pub(crate) mod ring;
pub(crate) mod state;
pub(crate) mod submit;
mod token;

#[cfg(target_os = "linux")]
mod uring;

pub use buffer::{BufferPool, ReleaseError, SlotId};
pub use request::{CancelOutcome, Op, OpKind, Outcome, Output, RequestId, RequestState};
pub use state::EngineStats;

use crate::config::{Backend, EngineConfig};
use crate::error::EngineError;
use ring::Ring;

/// Submission queue entries for a ring with `ring_depth` in-flight requests.
///
/// Leaves room for one cancellation per request on top of the I/O itself.
/// Overflow is handled by flushing, so this only sizes the common case.
pub(crate) fn ring_entries(ring_depth: usize) -> usize {
    (ring_depth * 2).next_power_of_two()
}

/// Open the ring backend selected by `config`.
pub(crate) fn open_ring(config: &EngineConfig) -> Result<Box<dyn Ring>, EngineError> {
    let entries = ring_entries(config.ring_depth);

    match config.backend {
        Backend::Blocking => Ok(Box::new(blocking::BlockingRing::new(
            entries,
            config.max_transfer,
        ))),

        #[cfg(target_os = "linux")]
        Backend::IoUring => {
            if config.max_transfer.is_some() {
                tracing::warn!("max_transfer only applies to the blocking backend, ignoring");
            }
            let ring = uring::UringRing::new(entries as u32, config.sqpoll_idle_ms)?;
            Ok(Box::new(ring))
        }

        #[cfg(not(target_os = "linux"))]
        Backend::IoUring => Err(EngineError::Io {
            source: std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "io_uring is only available on Linux",
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_entries() {
        assert_eq!(ring_entries(1), 2);
        assert_eq!(ring_entries(64), 128);
        assert_eq!(ring_entries(100), 256);
    }

    #[test]
    fn test_open_blocking_ring() {
        let config = EngineConfig::new(4, 4, 64).with_backend(Backend::Blocking);
        let ring = open_ring(&config).unwrap();
        assert_eq!(ring.name(), "blocking");
    }
}
