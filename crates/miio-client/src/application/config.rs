//! Runtime configuration for one device session.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use miio_core::{PayloadCompat, Token, DEFAULT_DEVICE_PORT};

/// Interval between probes when the link is quiet.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

/// How long a call waits for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(400);

/// Quiet keepalive intervals tolerated before a connected session is lost.
pub const DEFAULT_MAX_MISSED_KEEPALIVES: u32 = 3;

/// Shortest keepalive interval a session runs with.
pub const MIN_KEEPALIVE: Duration = Duration::from_secs(1);

/// Longest keepalive interval a session runs with.
pub const MAX_KEEPALIVE: Duration = Duration::from_secs(3_600);

/// Longest call timeout accepted from a config file.
pub const MAX_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a [`MiioClient`](super::client::MiioClient) needs to talk to
/// one device.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Device IP and UDP port.
    pub device_addr: SocketAddr,
    /// Local address the UDP socket binds to.
    pub local_addr: SocketAddr,
    /// Shared device token.
    pub token: Token,
    /// Quiet time after which a probe is (re-)sent.  Clamped to
    /// [`MIN_KEEPALIVE`]`..=`[`MAX_KEEPALIVE`] when the session starts.
    pub keepalive_interval: Duration,
    /// Deadline applied to each call.
    pub call_timeout: Duration,
    /// Consecutive quiet keepalive intervals before the session counts as lost.
    pub max_missed_keepalives: u32,
    /// Drop replies whose MD5 checksum does not match.
    pub verify_checksum: bool,
    /// Let a reply without an `id` resolve the only pending call.
    pub match_replies_without_id: bool,
    /// Request body post-processing for older devices.
    pub payload_compat: PayloadCompat,
}

impl SessionConfig {
    /// The keepalive interval the session actually runs with.
    pub fn effective_keepalive(&self) -> Duration {
        self.keepalive_interval.clamp(MIN_KEEPALIVE, MAX_KEEPALIVE)
    }

    /// Creates a config for `device_ip` with every other setting at its default.
    pub fn new(device_ip: std::net::IpAddr, token: Token) -> Self {
        Self {
            device_addr: SocketAddr::new(device_ip, DEFAULT_DEVICE_PORT),
            local_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_DEVICE_PORT),
            token,
            keepalive_interval: DEFAULT_KEEPALIVE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            max_missed_keepalives: DEFAULT_MAX_MISSED_KEEPALIVES,
            verify_checksum: true,
            match_replies_without_id: true,
            payload_compat: PayloadCompat::default(),
        }
    }
}
