//! Application layer: session use cases.
//!
//! - **`handshake`** – probe/hello state machine, clock offset, keepalive
//!   accounting and connection-loss detection.
//! - **`dispatcher`** – message-id allocation, request encoding and the
//!   table of calls awaiting their reply.
//! - **`client`** – the `MiioClient` facade and the background driver task
//!   that routes incoming datagrams to the two components above.
//! - **`config`** – the runtime `SessionConfig` value.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod handshake;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Locks `mutex`, recovering the data if a previous holder panicked.
///
/// The guarded values are plain state with no cross-field invariants a
/// panic could leave half-written, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Deadlines are capped this far ahead instead of overflowing `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + wait`, capped at [`FAR_FUTURE`].
pub(crate) fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start.checked_add(wait.min(FAR_FUTURE)).unwrap_or(start)
}
