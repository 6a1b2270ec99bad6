//! Protocol session shared by both ends of a connection.
//!
//! A [`Session`] sits on top of one transport. It owns the handshake state
//! machine, the local and remote identities, the negotiated protocol
//! version, and the map of outstanding request ids to their completions.
//! [`ClientSession`](crate::mcp::client::ClientSession) and
//! [`ServerSession`](crate::mcp::server::ServerSession) drive it from
//! opposite sides.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::mcp::events::EventEmitter;
use crate::mcp::protocol::{methods, CancelledParams, Implementation, Message, RequestId};
use crate::mcp::transport::{Transport, TransportState};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    /// Handshake request sent, waiting for the identity/capability exchange.
    Initializing,
    Ready,
    Closing,
    Error,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Observable change on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged { old: SessionState, new: SessionState },
}

/// Completion handle of one outstanding request.
pub type PendingRequest = oneshot::Sender<Result<Value>>;

/// Session state and request correlation over one transport.
pub struct Session {
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
    events: EventEmitter<SessionEvent>,
    local: Mutex<Implementation>,
    remote: OnceLock<Implementation>,
    protocol_version: OnceLock<String>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, local: Implementation) -> Self {
        Self {
            transport,
            state: Mutex::new(SessionState::Disconnected),
            events: EventEmitter::new(),
            local: Mutex::new(local),
            remote: OnceLock::new(),
            protocol_version: OnceLock::new(),
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    // ===== State =====

    pub fn state(&self) -> SessionState {
        *lock(&self.state)
    }

    /// Move to `new`. Setting the current state again emits nothing.
    pub fn set_state(&self, new: SessionState) {
        self.transition(|_| true, new);
    }

    /// Move to `new` only if the current state satisfies `allowed`.
    pub fn transition<F>(&self, allowed: F, new: SessionState) -> bool
    where
        F: FnOnce(SessionState) -> bool,
    {
        let mut changed = false;
        self.events.emit_with(|| {
            let mut state = lock(&self.state);
            let old = *state;
            if old == new || !allowed(old) {
                return None;
            }
            *state = new;
            changed = true;
            debug!("Session: {} -> {}", old, new);
            Some(SessionEvent::StateChanged { old, new })
        });
        changed
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    // ===== Identity =====

    pub fn local_identity(&self) -> Implementation {
        lock(&self.local).clone()
    }

    /// Replace the local identity. Only allowed before connecting.
    pub fn set_local_identity(&self, identity: Implementation) -> Result<()> {
        let state = self.state();
        if state != SessionState::Disconnected {
            return Err(Error::Protocol(format!(
                "local identity cannot change while the session is {}",
                state
            )));
        }
        *lock(&self.local) = identity;
        Ok(())
    }

    pub fn remote_identity(&self) -> Option<&Implementation> {
        self.remote.get()
    }

    /// Record the peer's identity. It can be set once per session.
    pub fn set_remote_identity(&self, identity: Implementation) -> Result<()> {
        self.remote
            .set(identity)
            .map_err(|_| Error::Protocol("remote identity already set".to_string()))
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.get().map(String::as_str)
    }

    /// Record the negotiated version. It can be set once per session.
    pub fn set_protocol_version(&self, version: impl Into<String>) -> Result<()> {
        self.protocol_version
            .set(version.into())
            .map_err(|_| Error::Protocol("protocol version already negotiated".to_string()))
    }

    // ===== Request correlation =====

    /// Next request id. Ids are strictly increasing and never reused.
    pub fn generate_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register the completion for `id`.
    pub fn add_pending_request(&self, id: RequestId, completion: PendingRequest) -> Result<()> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(&id) {
            return Err(Error::Protocol(format!("request id {} is already pending", id)));
        }
        pending.insert(id, completion);
        Ok(())
    }

    /// Remove and return the completion for `id`. At most one caller gets it.
    pub fn take_pending_request(&self, id: &RequestId) -> Option<PendingRequest> {
        lock(&self.pending).remove(id)
    }

    /// Fail every outstanding request with a connection-closed error.
    pub fn cancel_all_pending_requests(&self, reason: &str) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        let count = drained.len();
        if count > 0 {
            debug!("Cancelling {} pending request(s): {}", count, reason);
        }
        for (_, completion) in drained {
            let _ = completion.send(Err(Error::ConnectionClosed(reason.to_string())));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Complete the pending request a response or error answers.
    ///
    /// Returns false if the message is not a reply or matches nothing.
    pub fn route_response(&self, message: Message) -> bool {
        let (id, outcome) = match message {
            Message::Response(resp) => (resp.id, Ok(resp.result)),
            Message::Error(err) => match err.id {
                Some(id) => (id, Err(Error::from(err.error))),
                None => {
                    warn!(
                        "Peer reported an error for an unparseable message: {} ({})",
                        err.error.message, err.error.code
                    );
                    return false;
                }
            },
            _ => return false,
        };

        match self.take_pending_request(&id) {
            Some(completion) => {
                let _ = completion.send(outcome);
                true
            }
            None => {
                debug!("Dropping reply for unknown or cancelled request {}", id);
                false
            }
        }
    }

    // ===== Outbound =====

    pub async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        self.transport.send(message, cancel).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(&Message::notification(method, params), &CancellationToken::new())
            .await
    }

    /// Send a request and wait for its reply.
    ///
    /// Cancelling removes the pending entry and tells the peer with
    /// `notifications/cancelled`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let id = self.generate_request_id();
        let (tx, rx) = oneshot::channel();
        self.add_pending_request(id.clone(), tx)?;
        // Dropping this future (e.g. under a caller's timeout) clears the entry.
        let _entry = PendingEntry {
            session: self,
            id: id.clone(),
        };

        trace!("Request {} -> {}", id, method);
        self.send(&Message::request(id.clone(), method, params), cancel)
            .await?;

        tokio::select! {
            biased;
            outcome = rx => outcome.unwrap_or_else(|_| {
                Err(Error::ConnectionClosed("session dropped".to_string()))
            }),
            _ = cancel.cancelled() => {
                if self.take_pending_request(&id).is_some() {
                    self.send_cancelled(id, "cancelled by caller").await;
                }
                Err(Error::Cancelled)
            }
        }
    }

    async fn send_cancelled(&self, id: RequestId, reason: &str) {
        if !self.transport.state().can_send() {
            return;
        }
        let params = CancelledParams {
            request_id: id,
            reason: Some(reason.to_string()),
        };
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(e) => {
                warn!("Failed to encode cancellation: {}", e);
                return;
            }
        };
        if let Err(e) = self.notify(methods::CANCELLED, Some(params)).await {
            debug!("Failed to notify peer of cancellation: {}", e);
        }
    }

    /// Tear down after the transport went away.
    pub fn on_transport_closed(&self, transport_state: TransportState) {
        let new = if transport_state == TransportState::Error {
            SessionState::Error
        } else {
            SessionState::Disconnected
        };
        self.set_state(new);
        self.cancel_all_pending_requests("transport closed");
    }
}

/// Removes a request's pending entry when its caller stops waiting.
struct PendingEntry<'a> {
    session: &'a Session,
    id: RequestId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.session.take_pending_request(&self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel_all_pending_requests("session dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::{error_codes, JsonRpcError};
    use crate::mcp::transport::StdioTransport;
    use std::collections::HashSet;

    fn session() -> Session {
        let (a, _b) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(a);
        Session::new(
            Arc::new(StdioTransport::new(reader, writer)),
            Implementation::new("test", "1.0.0"),
        )
    }

    #[test]
    fn test_request_ids_are_distinct_and_increasing() {
        let session = session();
        let ids: Vec<_> = (0..100).map(|_| session.generate_request_id()).collect();

        assert_eq!(ids[0], RequestId::Number(1));
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 100);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_take_pending_is_at_most_once() {
        let session = session();
        let id = session.generate_request_id();
        let (tx, _rx) = oneshot::channel();
        session.add_pending_request(id.clone(), tx).unwrap();

        assert!(session.take_pending_request(&id).is_some());
        assert!(session.take_pending_request(&id).is_none());
    }

    #[test]
    fn test_duplicate_pending_id_rejected() {
        let session = session();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        session.add_pending_request(RequestId::from(5), tx1).unwrap();
        assert!(session.add_pending_request(RequestId::from(5), tx2).is_err());
    }

    #[tokio::test]
    async fn test_cancel_all_resolves_every_handle() {
        let session = session();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            session
                .add_pending_request(session.generate_request_id(), tx)
                .unwrap();
            receivers.push(rx);
        }

        assert_eq!(session.cancel_all_pending_requests("shutting down"), 3);
        assert_eq!(session.pending_count(), 0);

        for rx in receivers {
            match rx.await {
                Ok(Err(Error::ConnectionClosed(reason))) => assert_eq!(reason, "shutting down"),
                other => panic!("unexpected completion {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_route_response_and_error() {
        let session = session();
        let (tx, rx) = oneshot::channel();
        session.add_pending_request(RequestId::from(1), tx).unwrap();
        assert!(session.route_response(Message::response(RequestId::from(1), serde_json::json!({"ok": true}))));
        assert_eq!(rx.await.unwrap().unwrap()["ok"], true);

        let (tx, rx) = oneshot::channel();
        session.add_pending_request(RequestId::from("abc"), tx).unwrap();
        assert!(session.route_response(Message::error(
            Some(RequestId::from("abc")),
            JsonRpcError::new(error_codes::METHOD_NOT_FOUND, "nope"),
        )));
        match rx.await.unwrap() {
            Err(Error::Rpc { code, message, .. }) => {
                assert_eq!(code, error_codes::METHOD_NOT_FOUND);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected completion {:?}", other),
        }

        assert!(!session.route_response(Message::response(RequestId::from(99), Value::Null)));
    }

    #[tokio::test]
    async fn test_state_changes_emit_once() {
        let session = session();
        let mut events = session.subscribe();

        session.set_state(SessionState::Connecting);
        session.set_state(SessionState::Connecting);

        assert_eq!(
            events.recv().await,
            Some(SessionEvent::StateChanged {
                old: SessionState::Disconnected,
                new: SessionState::Connecting
            })
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_identity_rules() {
        let session = session();
        session
            .set_local_identity(Implementation::new("renamed", "2.0.0"))
            .unwrap();
        assert_eq!(session.local_identity().name, "renamed");

        session.set_state(SessionState::Connecting);
        assert!(session
            .set_local_identity(Implementation::new("late", "3.0.0"))
            .is_err());

        session
            .set_remote_identity(Implementation::new("peer", "1.0.0"))
            .unwrap();
        assert!(session
            .set_remote_identity(Implementation::new("other", "1.0.0"))
            .is_err());
        assert_eq!(session.remote_identity().unwrap().name, "peer");

        session.set_protocol_version("2025-06-18").unwrap();
        assert!(session.set_protocol_version("2024-11-05").is_err());
        assert_eq!(session.protocol_version(), Some("2025-06-18"));
    }

    #[tokio::test]
    async fn test_request_fails_when_not_connected() {
        let session = session();
        let result = session
            .request("ping", None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::NotConnected(_))));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_leaves_no_pending_entry() {
        let (a, _peer) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(a);
        let transport = Arc::new(StdioTransport::new(reader, writer));
        transport.connect(&CancellationToken::new()).await.unwrap();
        let session = Session::new(transport, Implementation::new("test", "1.0.0"));

        let cancel = CancellationToken::new();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            session.request("slow", None, &cancel),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(session.pending_count(), 0);
    }
}
