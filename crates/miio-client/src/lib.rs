//! miio-client library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # What does miio-client do? (for beginners)
//!
//! A miio device is a small appliance (air purifier, lamp, vacuum…) that
//! accepts encrypted JSON commands over UDP.  Talking to one takes three
//! cooperating pieces, all built on top of the `miio-core` codec:
//!
//! 1. A **handshake** – the client sends a 32-byte probe and the device
//!    answers with a 32-byte "hello" carrying its serial number and clock.
//!    The same probe is re-sent whenever the link has been quiet for the
//!    keepalive interval.
//! 2. A **request dispatcher** – every call gets a fresh message id, is
//!    encrypted and sent, and then waits (400 ms by default) for the reply
//!    carrying the same id.  Several calls may be in flight at once.
//! 3. A **transport** – the UDP socket, hidden behind a trait so the tests
//!    can swap in an in-memory pair of channels.
//!
//! [`MiioClient`] ties the three together and runs a background task that
//! reads datagrams and routes them: 32-byte packets to the handshake,
//! everything else to the dispatcher.

/// Application layer: handshake state machine, call correlation, client facade.
pub mod application;

/// Infrastructure layer: datagram transports and the TOML config file.
pub mod infrastructure;

pub use application::client::{ClientError, MiioClient};
pub use application::config::SessionConfig;
pub use application::dispatcher::CallError;
pub use application::handshake::{DisconnectReason, HandshakeState};
