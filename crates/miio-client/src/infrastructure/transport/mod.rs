//! Datagram transport abstraction.
//!
//! The session driver and the request dispatcher never touch a socket
//! directly; they go through [`DatagramTransport`].  Two implementations
//! are provided:
//!
//! - [`udp::UdpTransport`] – a tokio `UdpSocket` bound locally and aimed at
//!   one device address.
//! - [`memory::MemoryTransport`] – a pair of channels, used by the
//!   integration tests to play the device side in-process.
//!
//! # Concurrency
//!
//! `send` and `recv` both take `&self`.  The driver task sits in `recv`
//! while any number of callers `send` requests concurrently, so
//! implementations must allow both at once.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod udp;

pub use memory::{MemoryPeer, MemoryTransport};
pub use udp::UdpTransport;

/// Errors raised by a datagram transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The local socket could not be bound.
    #[error("failed to bind UDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// A send or receive failed after the socket was bound.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport has been closed and will deliver no more datagrams.
    #[error("transport closed")]
    Closed,
}

/// A connectionless, message-oriented link to exactly one device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Sends one datagram to the device.
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Waits for the next datagram from the device.
    ///
    /// Must be cancel-safe: the driver polls it inside `tokio::select!`.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;
}
