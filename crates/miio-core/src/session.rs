//! What a client knows about the device it is talking to.
//!
//! [`SessionState`] is updated from every hello reply and read whenever an
//! outgoing request header is built.  It is a plain value; the client crate
//! decides how it is shared between its handshake and request paths.
//!
//! # Clock offset
//!
//! Devices reject requests whose `stamp` is too far from their own clock, and
//! their clock usually counts from boot rather than from the Unix epoch.  On
//! each hello the client records `offset = device_stamp − local_unix_secs` and
//! stamps outgoing packets with `local_unix_secs + offset`.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::protocol::packet::{HeaderFields, PacketHeader};

/// Session state shared by the handshake and request paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    /// `true` once a hello reply has been received and the session has not
    /// since been lost or closed.
    pub connected: bool,
    /// Device serial from the last hello; `0xFFFFFFFF` before first contact.
    pub serial: u32,
    /// Reserved header field echoed from the device; `0xFFFFFFFF` before first contact.
    pub unknown: u32,
    /// Device time minus local time, in seconds, as of the last hello.
    pub clock_offset: i64,
    /// When the last datagram of any kind arrived from the device.
    pub last_packet_received_at: Option<Instant>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connected: false,
            serial: u32::MAX,
            unknown: u32::MAX,
            clock_offset: 0,
            last_packet_received_at: None,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learns serial, reserved field and clock offset from a hello reply
    /// received at local Unix time `now_secs`.
    pub fn observe_hello(&mut self, header: &PacketHeader, now_secs: i64) {
        self.serial = header.serial;
        self.unknown = header.unknown;
        self.clock_offset = i64::from(header.stamp) - now_secs;
    }

    /// Records that a datagram arrived at `at`.
    pub fn observe_packet(&mut self, at: Instant) {
        self.last_packet_received_at = Some(at);
    }

    /// The device-relative stamp for a packet sent at local Unix time `now_secs`.
    ///
    /// The result is truncated to the 32-bit wire field.
    pub fn stamp_at(&self, now_secs: i64) -> u32 {
        (now_secs + self.clock_offset) as u32
    }

    /// Header fields for a request sent at local Unix time `now_secs`.
    pub fn header_fields(&self, now_secs: i64) -> HeaderFields {
        HeaderFields {
            unknown: self.unknown,
            serial: self.serial,
            stamp: self.stamp_at(now_secs),
        }
    }
}

/// Current local time in whole seconds since the Unix epoch.
pub fn unix_now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
