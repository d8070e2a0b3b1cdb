//! HandshakeManager: probe/hello state machine and liveness tracking.
//!
//! # How the handshake works (for beginners)
//!
//! miio has no "connect" packet.  The client sends a fixed 32-byte probe
//! (`21 31 00 20 FF…FF`) and the device answers with a 32-byte header of
//! its own, the *hello*.  The hello carries two things the client needs
//! before it can send requests:
//!
//! - the device **serial**, copied into every request header, and
//! - the device **clock**, from which the client derives the offset used to
//!   stamp requests (`offset = device_stamp − local_unix_secs`).
//!
//! The same probe doubles as keepalive: the driver re-sends it whenever the
//! link has been quiet for one keepalive interval, and any datagram from the
//! device counts as a sign of life.
//!
//! # State machine
//!
//! ```text
//!   Init ──probe──▶ AwaitingHello ──hello──▶ Connected
//!                        ▲                       │
//!                        └──── N quiet intervals ┘
//!
//!   any state ──shutdown / transport failure──▶ Disconnected (terminal)
//! ```
//!
//! Every transition is published on a `watch` channel so callers can
//! await the first `Connected` or observe every change.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use miio_core::{build_probe, decode, ProtocolError, SessionState, HEADER_SIZE};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::lock;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The owner shut the client down.
    Shutdown,
    /// The socket failed after it was bound.
    TransportFailure(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Shutdown => f.write_str("shut down"),
            DisconnectReason::TransportFailure(reason) => write!(f, "transport failure: {reason}"),
        }
    }
}

/// Connection state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Nothing sent yet.
    Init,
    /// A probe is out and no hello has answered it (or the session was lost).
    AwaitingHello,
    /// A hello has been received and the device is considered alive.
    Connected,
    /// The session has ended and will not reconnect.
    Disconnected(DisconnectReason),
}

impl HandshakeState {
    pub fn is_connected(&self) -> bool {
        matches!(self, HandshakeState::Connected)
    }

    /// `true` once the session has ended for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Disconnected(_))
    }
}

/// Owns the connection state and applies hello and keepalive events to it.
#[derive(Debug)]
pub struct HandshakeManager {
    session: Arc<Mutex<SessionState>>,
    state: watch::Sender<HandshakeState>,
    missed_keepalives: AtomicU32,
    max_missed_keepalives: u32,
}

impl HandshakeManager {
    /// Creates a manager in [`HandshakeState::Init`].
    ///
    /// `max_missed_keepalives` of 0 disables connection-loss detection.
    pub fn new(session: Arc<Mutex<SessionState>>, max_missed_keepalives: u32) -> Self {
        let (state, _) = watch::channel(HandshakeState::Init);
        Self {
            session,
            state,
            missed_keepalives: AtomicU32::new(0),
            max_missed_keepalives,
        }
    }

    /// The current state.
    pub fn state(&self) -> HandshakeState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<HandshakeState> {
        self.state.subscribe()
    }

    /// Returns the probe datagram to send, moving `Init` to `AwaitingHello`.
    pub fn probe(&self) -> [u8; HEADER_SIZE] {
        self.state.send_if_modified(|state| {
            if *state == HandshakeState::Init {
                *state = HandshakeState::AwaitingHello;
                true
            } else {
                false
            }
        });
        build_probe()
    }

    /// Records that a datagram of any kind arrived at `at`.
    pub fn on_datagram(&self, at: std::time::Instant) {
        self.missed_keepalives.store(0, Ordering::Relaxed);
        lock(&self.session).observe_packet(at);
    }

    /// Applies a 32-byte hello received at local Unix time `now_secs`.
    ///
    /// Returns `true` if this hello (re)established the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] if the datagram is not a valid header.
    pub fn on_hello(&self, raw: &[u8], now_secs: i64) -> Result<bool, ProtocolError> {
        let packet = decode(raw)?;
        if self.state.borrow().is_terminal() {
            return Ok(false);
        }

        let (serial, clock_offset) = {
            let mut session = lock(&self.session);
            session.observe_hello(&packet.header, now_secs);
            session.connected = true;
            (session.serial, session.clock_offset)
        };
        debug!(
            "hello {} (serial {serial:#010x}, clock offset {clock_offset}s)",
            hex::encode(raw)
        );

        let connected = self.state.send_if_modified(|state| match state {
            HandshakeState::Connected | HandshakeState::Disconnected(_) => false,
            _ => {
                *state = HandshakeState::Connected;
                true
            }
        });
        if connected {
            info!("connected to device {serial:#010x}");
        }
        Ok(connected)
    }

    /// Accounts for one keepalive interval that passed without a datagram.
    ///
    /// Returns `true` if this made a connected session count as lost; the
    /// state then drops back to `AwaitingHello` and the next hello
    /// reconnects.
    pub fn on_keepalive_due(&self) -> bool {
        let missed = self.missed_keepalives.fetch_add(1, Ordering::Relaxed) + 1;
        if self.max_missed_keepalives == 0 || missed < self.max_missed_keepalives {
            return false;
        }

        let lost = self.state.send_if_modified(|state| {
            if *state == HandshakeState::Connected {
                *state = HandshakeState::AwaitingHello;
                true
            } else {
                false
            }
        });
        if lost {
            lock(&self.session).connected = false;
            self.missed_keepalives.store(0, Ordering::Relaxed);
            warn!("no datagram from device for {missed} keepalive intervals, connection lost");
        }
        lost
    }

    /// Ends the session.  Returns `false` if it had already ended.
    pub fn shut_down(&self, reason: DisconnectReason) -> bool {
        lock(&self.session).connected = false;
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                info!("session ended: {reason}");
                *state = HandshakeState::Disconnected(reason);
                true
            }
        })
    }
}
