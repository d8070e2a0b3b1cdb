//! Message-id counter for outgoing calls.
//!
//! # What is a message id? (for beginners)
//!
//! Every request carries an integer `id` in its JSON body, and the device
//! copies it into the reply.  The client uses it to tell which pending call
//! a reply belongs to.  Ids start at 1 and grow by one per call, whether or
//! not earlier calls succeeded.
//!
//! # Thread safety
//!
//! The counter uses an `AtomicU32`, so concurrent callers each get a distinct
//! id without taking a lock.

use std::sync::atomic::{AtomicU32, Ordering};

/// A thread-safe, monotonically increasing message-id counter.
///
/// The first id is 1.  Id 0 is never handed out: after `u32::MAX` the
/// counter wraps to 1.
///
/// # Examples
///
/// ```rust
/// use miio_core::protocol::MessageCounter;
///
/// let counter = MessageCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
#[derive(Debug)]
pub struct MessageCounter {
    inner: AtomicU32,
}

impl MessageCounter {
    /// Creates a counter whose first id is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU32::new(1),
        }
    }

    /// Returns the next id and advances the counter.
    pub fn next(&self) -> u32 {
        loop {
            // `fetch_add` wraps on overflow; skip the 0 that follows u32::MAX.
            let id = self.inner.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// The id the next call to [`next`](Self::next) will return (ignoring wrap).
    pub fn peek(&self) -> u32 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for MessageCounter {
    fn default() -> Self {
        Self::new()
    }
}
