//! UDP transport backed by a tokio socket.
//!
//! # Source filtering
//!
//! The local port may receive traffic from anything on the LAN.  Only
//! datagrams whose source is the configured device address are returned;
//! everything else is logged at `debug` and skipped.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use super::{DatagramTransport, TransportError};

/// Largest datagram a UDP socket can deliver.
const MAX_DATAGRAM: usize = 65_535;

/// A UDP socket talking to a single device.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    device: SocketAddr,
}

impl UdpTransport {
    /// Binds `local` and targets `device`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Bind`] if the local address is unavailable.
    pub async fn bind(local: SocketAddr, device: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| TransportError::Bind {
                addr: local,
                source,
            })?;
        info!(
            "UDP transport bound on {} for device {device}",
            socket.local_addr().unwrap_or(local)
        );
        Ok(Self { socket, device })
    }

    /// The address the socket is actually bound to (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// The device address datagrams are sent to and accepted from.
    pub fn device_addr(&self) -> SocketAddr {
        self.device
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        self.socket.send_to(datagram, self.device).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if from != self.device {
                debug!("dropping {len}-byte datagram from unexpected source {from}");
                continue;
            }
            buf.truncate(len);
            return Ok(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_reaches_device_socket() {
        // Arrange
        let device = UdpSocket::bind(loopback()).await.unwrap();
        let transport = UdpTransport::bind(loopback(), device.local_addr().unwrap())
            .await
            .unwrap();

        // Act
        transport.send(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = device.recv_from(&mut buf).await.unwrap();

        // Assert
        assert_eq!(&buf[..len], b"hello");
        assert_eq!(from, transport.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_recv_skips_datagrams_from_other_sources() {
        // Arrange
        let device = UdpSocket::bind(loopback()).await.unwrap();
        let stranger = UdpSocket::bind(loopback()).await.unwrap();
        let transport = UdpTransport::bind(loopback(), device.local_addr().unwrap())
            .await
            .unwrap();
        let target = transport.local_addr().unwrap();

        // Act
        stranger.send_to(b"noise", target).await.unwrap();
        device.send_to(b"reply", target).await.unwrap();
        let got = transport.recv().await.unwrap();

        // Assert
        assert_eq!(got, b"reply");
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_bind_error() {
        // Arrange – occupy a port first
        let taken = UdpSocket::bind(loopback()).await.unwrap();
        let addr = taken.local_addr().unwrap();

        // Act
        let result = UdpTransport::bind(addr, addr).await;

        // Assert
        assert!(matches!(result, Err(TransportError::Bind { addr: a, .. }) if a == addr));
    }
}
