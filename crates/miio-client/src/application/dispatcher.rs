//! RequestDispatcher: turns "send a method call, await its reply" into one
//! async operation.
//!
//! # How replies find their caller (for beginners)
//!
//! UDP has no notion of a request/response pair.  Each call is given a
//! fresh message id, which the device echoes in its reply:
//!
//! ```text
//! caller A ── {"id":7,"method":"get_prop",...} ──▶
//! caller B ── {"id":8,"method":"set_power",...} ──▶
//!          ◀── {"id":8,"result":["ok"]}   resolves B
//!          ◀── {"id":7,"result":["on"]}   resolves A
//! ```
//!
//! The dispatcher keeps a table `id → pending call`.  A call is registered
//! *before* its datagram is sent, so even an instant reply finds its entry.
//! When a reply arrives the driver task hands it to
//! [`RequestDispatcher::handle_reply`], which decrypts it, reads its `id`
//! and completes exactly that entry through a `oneshot` channel.  A call
//! whose deadline passes removes its own entry, so a late reply is dropped
//! instead of resolving somebody else.
//!
//! Once the session ends, [`RequestDispatcher::fail_all`] also lets go of the
//! transport, so the local UDP port is free for a new client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use miio_core::{
    encode_request, open_reply, unix_now_secs, DerivedKeys, MessageCounter, PayloadCompat,
    ProtocolError, Request, SessionState,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{deadline_after, lock};
use crate::infrastructure::transport::DatagramTransport;

/// Why a call did not produce a result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// No reply carrying this call's id arrived before the deadline.
    #[error("call {id} timed out after {timeout:?}")]
    Timeout { id: u32, timeout: Duration },
    /// The request could not be sent.
    #[error("transport error: {0}")]
    Transport(String),
    /// The session has ended; no further calls are accepted.
    #[error("session closed")]
    SessionClosed,
    /// The request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(#[from] ProtocolError),
    /// The device answered with an error object.
    #[error("device error {code}: {message}")]
    Device { code: i64, message: String },
}

/// What became of one incoming reply datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// The reply completed the call with this id.
    Resolved(u32),
    /// The reply decoded but matched no pending call.
    Unmatched(Option<u32>),
    /// The datagram could not be decoded and was discarded.
    Dropped(ProtocolError),
}

/// A call waiting for its reply.
#[derive(Debug)]
struct PendingCall {
    method: String,
    issued_at: Instant,
    deadline: Instant,
    completion: oneshot::Sender<Result<Value, CallError>>,
}

/// Allocates message ids, sends requests and correlates replies.
pub struct RequestDispatcher {
    /// Emptied when the session ends.
    transport: Mutex<Option<Arc<dyn DatagramTransport>>>,
    keys: DerivedKeys,
    session: Arc<Mutex<SessionState>>,
    counter: MessageCounter,
    pending: Mutex<HashMap<u32, PendingCall>>,
    call_timeout: Duration,
    compat: PayloadCompat,
    verify_checksum: bool,
    match_replies_without_id: bool,
    closed: AtomicBool,
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("next_id", &self.counter.peek())
            .field("pending", &self.pending_count())
            .field("call_timeout", &self.call_timeout)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes a call's table entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    dispatcher: &'a RequestDispatcher,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.dispatcher.pending).remove(&self.id);
    }
}

impl RequestDispatcher {
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        keys: DerivedKeys,
        session: Arc<Mutex<SessionState>>,
        call_timeout: Duration,
        compat: PayloadCompat,
        verify_checksum: bool,
    ) -> Self {
        Self {
            transport: Mutex::new(Some(transport)),
            keys,
            session,
            counter: MessageCounter::new(),
            pending: Mutex::new(HashMap::new()),
            call_timeout,
            compat,
            verify_checksum,
            match_replies_without_id: true,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether a reply with no `id` may resolve the only pending call.
    ///
    /// On by default.  A late id-less reply to a call that already timed out
    /// would resolve whichever call is pending at that moment; turn this off
    /// when talking to devices that always echo the id.
    pub fn match_replies_without_id(mut self, enabled: bool) -> Self {
        self.match_replies_without_id = enabled;
        self
    }

    /// Calls `method` with the default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        self.call_with_timeout(method, params, self.call_timeout).await
    }

    /// Calls `method` and waits up to `timeout` for the reply.
    ///
    /// Resolves with the whole decrypted reply object, e.g.
    /// `{"id":3,"result":["on"]}`.
    ///
    /// # Errors
    ///
    /// See [`CallError`].  A timeout affects only this call.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        if self.is_closed() {
            return Err(CallError::SessionClosed);
        }

        let id = self.counter.next();
        let fields = lock(&self.session).header_fields(unix_now_secs());
        let request = Request::new(id, method, params);
        let datagram = encode_request(&request, &self.keys, fields, self.compat)?;

        let issued_at = Instant::now();
        let deadline = deadline_after(issued_at, timeout);
        let (completion, reply) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingCall {
                method: method.to_string(),
                issued_at,
                deadline,
                completion,
            },
        );
        let _guard = PendingGuard { dispatcher: self, id };

        // `fail_all` may have drained the table between the check above and the insert.
        if self.is_closed() {
            return Err(CallError::SessionClosed);
        }

        let transport = lock(&self.transport).clone();
        let Some(transport) = transport else {
            return Err(CallError::SessionClosed);
        };
        let sent = transport.send(&datagram).await;
        drop(transport);
        if let Err(e) = sent {
            warn!("failed to send call {id} ({method}): {e}");
            return Err(CallError::Transport(e.to_string()));
        }
        debug!("sent call {id} ({method}, {} bytes)", datagram.len());

        match tokio::time::timeout_at(deadline, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::SessionClosed),
            Err(_) => {
                debug!("call {id} ({method}) timed out after {timeout:?}");
                Err(CallError::Timeout { id, timeout })
            }
        }
    }

    /// Routes one non-hello datagram to the call it answers.
    pub fn handle_reply(&self, raw: &[u8]) -> ReplyOutcome {
        let reply = match open_reply(raw, &self.keys, self.verify_checksum) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("dropping undecodable {}-byte datagram: {e}", raw.len());
                return ReplyOutcome::Dropped(e);
            }
        };

        let id = reply
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok());

        let entry = {
            let mut pending = lock(&self.pending);
            match id {
                Some(id) => pending.remove(&id).map(|call| (id, call)),
                // Only unambiguous while one call is pending, and even then a late
                // reply to a timed-out call lands on its successor.
                None if self.match_replies_without_id && pending.len() == 1 => {
                    let only = pending.keys().next().copied();
                    only.and_then(|id| pending.remove(&id).map(|call| (id, call)))
                }
                None => None,
            }
        };

        let Some((id, call)) = entry else {
            debug!("reply {id:?} matches no pending call, dropping");
            return ReplyOutcome::Unmatched(id);
        };

        let now = Instant::now();
        if now > call.deadline {
            debug!("reply for call {id} arrived after its deadline");
        }
        debug!(
            "call {id} ({}) answered in {:?}",
            call.method,
            now.saturating_duration_since(call.issued_at)
        );
        let _ = call.completion.send(reply_result(reply));
        ReplyOutcome::Resolved(id)
    }

    /// Fails every pending call with `error`, refuses new ones and releases
    /// the transport.
    pub fn fail_all(&self, error: CallError) {
        self.closed.store(true, Ordering::SeqCst);
        if lock(&self.transport).take().is_some() {
            debug!("released transport");
        }
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!("failing {} pending call(s): {error}", drained.len());
        }
        for (_, call) in drained {
            let _ = call.completion.send(Err(error.clone()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// The id the next call will use.
    pub fn next_id(&self) -> u32 {
        self.counter.peek()
    }
}

/// Maps a reply object to a call result, surfacing the device error envelope.
fn reply_result(reply: Value) -> Result<Value, CallError> {
    match reply.get("error") {
        Some(error) => Err(CallError::Device {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        None => Ok(reply),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::transport::{memory, MockDatagramTransport, TransportError};
    use miio_core::{decode, decrypt_body, encode_packet, HeaderFields, Token};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_millis(400);

    fn keys() -> DerivedKeys {
        Token::from_hex("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .derive_keys()
    }

    fn dispatcher(transport: Arc<dyn DatagramTransport>) -> RequestDispatcher {
        RequestDispatcher::new(
            transport,
            keys(),
            Arc::new(Mutex::new(SessionState::new())),
            TIMEOUT,
            PayloadCompat::default(),
            true,
        )
    }

    fn reply(body: &str) -> Vec<u8> {
        let fields = HeaderFields {
            unknown: 0,
            serial: 1,
            stamp: 1,
        };
        encode_packet(body.as_bytes(), &keys(), fields).unwrap()
    }

    fn sent_json(datagram: &[u8]) -> Value {
        let text = decrypt_body(&decode(datagram).unwrap(), &keys()).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_reply() {
        // Arrange
        let (transport, mut device) = memory::pair();
        let d = Arc::new(dispatcher(Arc::new(transport)));
        let caller = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.call("get_prop", json!(["power"])).await })
        };

        // Act
        let request = sent_json(&device.next_sent().await.unwrap());
        let outcome = d.handle_reply(&reply(r#"{"id":1,"result":["on"]}"#));

        // Assert
        assert_eq!(request, json!({"id": 1, "method": "get_prop", "params": ["power"]}));
        assert_eq!(outcome, ReplyOutcome::Resolved(1));
        assert_eq!(caller.await.unwrap().unwrap(), json!({"id": 1, "result": ["on"]}));
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_stays_pending_until_reply_arrives() {
        // Arrange
        let (transport, _device) = memory::pair();
        let d = dispatcher(Arc::new(transport));
        let mut call = tokio_test::task::spawn(d.call("get_prop", json!(["power"])));

        // Act / Assert – registered and waiting
        tokio_test::assert_pending!(call.poll());
        assert_eq!(d.pending_count(), 1);

        d.handle_reply(&reply(r#"{"id":1,"result":["on"]}"#));

        assert!(call.is_woken());
        let result = tokio_test::assert_ready!(call.poll());
        assert_eq!(result.unwrap()["result"], json!(["on"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_and_late_reply_is_unmatched() {
        // Arrange
        let (transport, _device) = memory::pair();
        let d = dispatcher(Arc::new(transport));

        // Act
        let result = d.call("get_prop", json!(["power"])).await;
        let late = d.handle_reply(&reply(r#"{"id":1,"result":["on"]}"#));

        // Assert
        assert_eq!(result, Err(CallError::Timeout { id: 1, timeout: TIMEOUT }));
        assert_eq!(late, ReplyOutcome::Unmatched(Some(1)));
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_failure_surfaces_transport_error_and_clears_entry() {
        // Arrange
        let mut mock = MockDatagramTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Err(TransportError::Closed));
        let d = dispatcher(Arc::new(mock));

        // Act
        let result = d.call("miIO.info", Value::Null).await;

        // Assert
        assert_eq!(result, Err(CallError::Transport("transport closed".into())));
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ids_advance_even_when_calls_fail() {
        // Arrange
        let mut mock = MockDatagramTransport::new();
        mock.expect_send()
            .times(2)
            .returning(|_| Err(TransportError::Closed));
        let d = dispatcher(Arc::new(mock));

        // Act
        let _ = d.call("a", Value::Null).await;
        let _ = d.call("b", Value::Null).await;

        // Assert
        assert_eq!(d.next_id(), 3);
    }

    #[tokio::test]
    async fn test_device_error_object_becomes_device_error() {
        // Arrange
        let (transport, mut device) = memory::pair();
        let d = Arc::new(dispatcher(Arc::new(transport)));
        let caller = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.call("set_power", json!(["on"])).await })
        };
        device.next_sent().await.unwrap();

        // Act
        d.handle_reply(&reply(
            r#"{"id":1,"error":{"code":-5001,"message":"command error"}}"#,
        ));

        // Assert
        assert_eq!(
            caller.await.unwrap(),
            Err(CallError::Device {
                code: -5001,
                message: "command error".into()
            })
        );
    }

    #[tokio::test]
    async fn test_reply_without_id_resolves_single_pending_call() {
        // Arrange
        let (transport, mut device) = memory::pair();
        let d = Arc::new(dispatcher(Arc::new(transport)));
        let caller = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.call("miIO.info", Value::Null).await })
        };
        device.next_sent().await.unwrap();

        // Act
        let outcome = d.handle_reply(&reply(r#"{"result":"ok"}"#));

        // Assert
        assert_eq!(outcome, ReplyOutcome::Resolved(1));
        assert_eq!(caller.await.unwrap().unwrap(), json!({"result": "ok"}));
    }

    #[tokio::test]
    async fn test_reply_without_id_is_unmatched_when_fallback_is_off() {
        // Arrange
        let (transport, mut device) = memory::pair();
        let d = Arc::new(dispatcher(Arc::new(transport)).match_replies_without_id(false));
        let caller = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.call("miIO.info", Value::Null).await })
        };
        device.next_sent().await.unwrap();

        // Act
        let outcome = d.handle_reply(&reply(r#"{"result":"ok"}"#));

        // Assert
        assert_eq!(outcome, ReplyOutcome::Unmatched(None));
        assert_eq!(d.pending_count(), 1);
        caller.abort();
    }

    #[tokio::test]
    async fn test_unbounded_timeout_waits_for_reply_without_overflow() {
        // Arrange
        let (transport, _device) = memory::pair();
        let d = dispatcher(Arc::new(transport));
        let mut call = tokio_test::task::spawn(d.call_with_timeout(
            "get_prop",
            json!(["power"]),
            Duration::MAX,
        ));

        // Act
        tokio_test::assert_pending!(call.poll());
        d.handle_reply(&reply(r#"{"id":1,"result":["on"]}"#));

        // Assert
        let result = tokio_test::assert_ready!(call.poll());
        assert_eq!(result.unwrap()["result"], json!(["on"]));
    }

    #[tokio::test]
    async fn test_fail_all_releases_transport() {
        // Arrange
        let (transport, _device) = memory::pair();
        let transport = Arc::new(transport);
        let d = dispatcher(transport.clone());
        assert_eq!(Arc::strong_count(&transport), 2);

        // Act
        d.fail_all(CallError::Transport("socket closed".into()));

        // Assert
        assert_eq!(Arc::strong_count(&transport), 1);
        assert_eq!(
            d.call("get_prop", json!(["power"])).await,
            Err(CallError::SessionClosed)
        );
    }

    #[test]
    fn test_undecodable_reply_is_dropped() {
        // Arrange
        let (transport, _device) = memory::pair();
        let d = dispatcher(Arc::new(transport));
        let mut tampered = reply(r#"{"id":1,"result":[]}"#);
        tampered[40] ^= 0xFF;

        // Act
        let outcome = d.handle_reply(&tampered);

        // Assert
        assert_eq!(outcome, ReplyOutcome::Dropped(ProtocolError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn test_fail_all_fails_pending_and_rejects_new_calls() {
        // Arrange
        let (transport, mut device) = memory::pair();
        let d = Arc::new(dispatcher(Arc::new(transport)));
        let caller = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.call("get_prop", json!(["power"])).await })
        };
        device.next_sent().await.unwrap();

        // Act
        d.fail_all(CallError::SessionClosed);

        // Assert
        assert_eq!(caller.await.unwrap(), Err(CallError::SessionClosed));
        assert_eq!(
            d.call("get_prop", json!(["power"])).await,
            Err(CallError::SessionClosed)
        );
        assert!(device.try_next_sent().is_none());
    }

    #[tokio::test]
    async fn test_dropped_call_future_removes_its_entry() {
        // Arrange
        let (transport, mut device) = memory::pair();
        let d = Arc::new(dispatcher(Arc::new(transport)));
        let caller = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.call("get_prop", json!(["power"])).await })
        };
        device.next_sent().await.unwrap();
        assert_eq!(d.pending_count(), 1);

        // Act
        caller.abort();
        let _ = caller.await;

        // Assert
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn test_reply_result_passes_through_success() {
        let reply = json!({"id": 4, "result": [1, 2]});
        assert_eq!(reply_result(reply.clone()), Ok(reply));
    }
}
