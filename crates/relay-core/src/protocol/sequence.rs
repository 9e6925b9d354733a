//! Per-connection frame sequence numbers.
//!
//! Each side of a connection stamps its outgoing frames with a number that
//! starts at 0 and grows by one per frame.  The relay does not reorder or
//! retransmit anything (TCP already does), so the numbers are diagnostic:
//! they show up in trace logs and make a gap in a capture easy to spot.
//!
//! # Why an atomic? (for beginners)
//!
//! A session's writer task is the only producer of frames, but the counter is
//! also read from log statements in other tasks.  `AtomicU64` lets both
//! happen without a lock: `fetch_add` reads and increments in one indivisible
//! step.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing, wrap-around frame counter.
///
/// ```rust
/// use relay_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.sent(), 2);
/// ```
#[derive(Debug, Default)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number for the next frame and advances the counter.
    ///
    /// Wraps from `u64::MAX` to 0.  `Relaxed` is enough: the value orders
    /// frames, it does not publish any other memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// How many numbers have been handed out so far (modulo 2^64).
    pub fn sent(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}
