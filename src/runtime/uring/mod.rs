//! Linux io_uring backend.
//!
//! Completion-based I/O with batched submissions for high throughput.

mod ring;

pub(crate) use ring::UringRing;
