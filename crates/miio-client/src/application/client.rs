//! MiioClient: the public face of a device session.
//!
//! A `MiioClient` owns one [`HandshakeManager`], one [`RequestDispatcher`]
//! and a background *driver* task.  The driver is the only reader of the
//! transport:
//!
//! ```text
//!                 ┌─────────────── driver task ───────────────┐
//!  transport.recv │ len == 32 ──▶ HandshakeManager::on_hello   │
//!  ──────────────▶│ otherwise ──▶ RequestDispatcher::handle_reply
//!                 │ quiet for keepalive interval ──▶ send probe│
//!                 └────────────────────────────────────────────┘
//!  caller ──▶ MiioClient::call ──▶ RequestDispatcher ──▶ transport.send
//! ```
//!
//! Every datagram, hello or reply, pushes the keepalive deadline back by one
//! interval.  A transport error ends the session: all pending calls fail
//! and the state becomes `Disconnected`.  The client never restarts itself;
//! the owner decides whether to build a new one.  Both ways of ending the
//! session drop the transport, so a new client can bind the same local port.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use miio_core::{unix_now_secs, SessionState, HEADER_SIZE};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::dispatcher::{CallError, RequestDispatcher};
use super::handshake::{DisconnectReason, HandshakeManager, HandshakeState};
use super::{deadline_after, lock};
use crate::infrastructure::transport::{DatagramTransport, TransportError, UdpTransport};

/// Errors from creating or waiting on a client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The transport could not be set up.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The session ended before the awaited event happened.
    #[error("session ended: {0}")]
    Disconnected(DisconnectReason),
    /// A call failed.
    #[error(transparent)]
    Call(#[from] CallError),
}

/// An async client for one miio device.
#[derive(Debug)]
pub struct MiioClient {
    session: Arc<Mutex<SessionState>>,
    handshake: Arc<HandshakeManager>,
    dispatcher: Arc<RequestDispatcher>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MiioClient {
    /// Binds a UDP socket per `config` and starts the session.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the local address cannot be bound.
    pub async fn connect(config: SessionConfig) -> Result<Self, ClientError> {
        let transport = UdpTransport::bind(config.local_addr, config.device_addr).await?;
        Ok(Self::start(config, Arc::new(transport)))
    }

    /// Starts a session over an existing transport.
    ///
    /// Sends the first probe immediately.  Must be called from within a
    /// tokio runtime.
    pub fn start(config: SessionConfig, transport: Arc<dyn DatagramTransport>) -> Self {
        let session = Arc::new(Mutex::new(SessionState::new()));
        let handshake = Arc::new(HandshakeManager::new(
            Arc::clone(&session),
            config.max_missed_keepalives,
        ));
        let dispatcher = Arc::new(
            RequestDispatcher::new(
                Arc::clone(&transport),
                config.token.derive_keys(),
                Arc::clone(&session),
                config.call_timeout,
                config.payload_compat,
                config.verify_checksum,
            )
            .match_replies_without_id(config.match_replies_without_id),
        );

        let keepalive = config.effective_keepalive();
        if keepalive != config.keepalive_interval {
            warn!(
                "keepalive interval {:?} is out of range, using {keepalive:?}",
                config.keepalive_interval
            );
        }
        let driver = Driver {
            transport,
            handshake: Arc::clone(&handshake),
            dispatcher: Arc::clone(&dispatcher),
            keepalive,
        };
        info!("starting miio session with {}", config.device_addr);
        let handle = tokio::spawn(driver.run());

        Self {
            session,
            handshake,
            dispatcher,
            driver: Mutex::new(Some(handle)),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// A snapshot of what is known about the device.
    pub fn session(&self) -> SessionState {
        lock(&self.session).clone()
    }

    /// A receiver that observes every state change.
    pub fn state_changes(&self) -> watch::Receiver<HandshakeState> {
        self.handshake.subscribe()
    }

    /// Waits until the session is connected.
    ///
    /// Returns immediately if it already is.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Disconnected`] if the session ends first.
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut changes = self.handshake.subscribe();
        let state = changes
            .wait_for(|state| state.is_connected() || state.is_terminal())
            .await
            .map(|state| HandshakeState::clone(&state));
        match state {
            Ok(HandshakeState::Disconnected(reason)) => Err(ClientError::Disconnected(reason)),
            Ok(_) => Ok(()),
            Err(_) => Err(ClientError::Disconnected(DisconnectReason::Shutdown)),
        }
    }

    /// Calls `method` on the device and returns the decrypted reply object.
    ///
    /// # Errors
    ///
    /// See [`CallError`].
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.dispatcher.call(method, params).await
    }

    /// Like [`call`](Self::call) with a per-call deadline.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        self.dispatcher.call_with_timeout(method, params, timeout).await
    }

    /// Ends the session: pending calls fail with [`CallError::SessionClosed`],
    /// no further probes are sent and the state becomes `Disconnected`.
    ///
    /// Returns once the driver task has stopped and the transport has been
    /// dropped.
    pub async fn shutdown(&self) {
        self.dispatcher.fail_all(CallError::SessionClosed);
        self.handshake.shut_down(DisconnectReason::Shutdown);
        let driver = lock(&self.driver).take();
        if let Some(handle) = driver {
            handle.abort();
            let _ = handle.await;
        }
        debug!("session shut down");
    }
}

impl Drop for MiioClient {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.driver).take() {
            handle.abort();
        }
    }
}

// ── Driver task ───────────────────────────────────────────────────────────────

/// Reads the transport and keeps the session alive.
struct Driver {
    transport: Arc<dyn DatagramTransport>,
    handshake: Arc<HandshakeManager>,
    dispatcher: Arc<RequestDispatcher>,
    keepalive: Duration,
}

impl Driver {
    async fn run(self) {
        if let Err(e) = self.send_probe().await {
            self.fail(e);
            return;
        }
        let mut deadline = deadline_after(Instant::now(), self.keepalive);

        loop {
            tokio::select! {
                received = self.transport.recv() => match received {
                    Ok(datagram) => {
                        let now = Instant::now();
                        deadline = deadline_after(now, self.keepalive);
                        self.handshake.on_datagram(now.into_std());
                        self.route(&datagram);
                    }
                    Err(e) => {
                        self.fail(e);
                        return;
                    }
                },
                () = tokio::time::sleep_until(deadline) => {
                    self.handshake.on_keepalive_due();
                    if let Err(e) = self.send_probe().await {
                        self.fail(e);
                        return;
                    }
                    deadline = deadline_after(Instant::now(), self.keepalive);
                }
            }
        }
    }

    async fn send_probe(&self) -> Result<(), TransportError> {
        let probe = self.handshake.probe();
        debug!("sending probe");
        self.transport.send(&probe).await
    }

    fn route(&self, datagram: &[u8]) {
        if datagram.len() == HEADER_SIZE {
            if let Err(e) = self.handshake.on_hello(datagram, unix_now_secs()) {
                warn!("ignoring malformed hello: {e}");
            }
        } else {
            self.dispatcher.handle_reply(datagram);
        }
    }

    fn fail(&self, e: TransportError) {
        error!("transport failed, ending session: {e}");
        let reason = e.to_string();
        self.dispatcher.fail_all(CallError::Transport(reason.clone()));
        self.handshake.shut_down(DisconnectReason::TransportFailure(reason));
    }
}
