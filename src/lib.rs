//! batched-io: a batched file I/O engine
//!
//! Callers enqueue positional reads and writes from any thread; a single
//! driver thread batches them into a kernel ring and reaps completions.
//!
//! Features:
//! - io_uring backend on Linux, portable `pread`/`pwrite` backend elsewhere
//! - Fixed pool of aligned buffer slots with explicit backpressure
//! - Bounded in-flight operations with FIFO submission order
//! - Transparent retry of short reads and writes
//! - Cancellation and draining shutdown
//!
//! ```no_run
//! use batched_io::{Backend, Engine, EngineConfig};
//! use std::os::unix::io::AsRawFd;
//!
//! let file = std::fs::File::open("data.bin")?;
//! let engine = Engine::new(EngineConfig::new(64, 128, 64 * 1024).with_backend(Backend::Blocking))?;
//! let id = engine.read(file.as_raw_fd(), 0, 4096)?;
//! let bytes = engine.wait(id, None)?.into_bytes();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod config;
mod engine;
pub mod error;
pub mod runtime;

pub use config::{Backend, EngineConfig};
pub use engine::{Engine, ShutdownReport};
pub use error::{EngineError, ErrorKind};
pub use runtime::{
    CancelOutcome, EngineStats, Op, OpKind, Outcome, Output, RequestId, RequestState,
};
