//! In-memory transport for tests and embedders.
//!
//! [`pair`] returns a [`MemoryTransport`] for the client and a
//! [`MemoryPeer`] that plays the device: it observes every datagram the
//! client sends and injects replies (or a socket failure) on demand.
//!
//! # Usage in tests
//!
//! ```ignore
//! let (transport, mut device) = memory::pair();
//! let client = MiioClient::start(config, Arc::new(transport))?;
//!
//! let probe = device.next_sent().await.unwrap();
//! assert_eq!(probe, build_probe());
//! device.deliver(hello_bytes);
//! ```

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{DatagramTransport, TransportError};

/// What the peer pushes towards the client.
#[derive(Debug)]
enum Inbound {
    Datagram(Vec<u8>),
    Fail(String),
}

/// Client half of an in-memory datagram link.
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

/// Device half of an in-memory datagram link.
#[derive(Debug)]
pub struct MemoryPeer {
    sent: mpsc::UnboundedReceiver<Vec<u8>>,
    inject: mpsc::UnboundedSender<Inbound>,
}

/// Creates a connected transport/peer pair.
pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
        },
        MemoryPeer {
            sent: out_rx,
            inject: in_tx,
        },
    )
}

impl MemoryPeer {
    /// Delivers `datagram` to the client.  Ignored once the client is gone.
    pub fn deliver(&self, datagram: impl Into<Vec<u8>>) {
        let _ = self.inject.send(Inbound::Datagram(datagram.into()));
    }

    /// Makes the client's next `recv` fail with an I/O error.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.inject.send(Inbound::Fail(reason.into()));
    }

    /// Waits for the next datagram the client sent; `None` once the client
    /// transport has been dropped.
    pub async fn next_sent(&mut self) -> Option<Vec<u8>> {
        self.sent.recv().await
    }

    /// Returns a datagram the client already sent, without waiting.
    pub fn try_next_sent(&mut self) -> Option<Vec<u8>> {
        self.sent.try_recv().ok()
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        self.outbound
            .send(datagram.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(Inbound::Datagram(bytes)) => Ok(bytes),
            Some(Inbound::Fail(reason)) => Err(TransportError::Io(std::io::Error::other(reason))),
            None => Err(TransportError::Closed),
        }
    }
}
