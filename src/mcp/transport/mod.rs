//! MCP transport layer implementations.
//!
//! Every transport governs exactly one peer connection and satisfies the
//! [`Transport`] contract: a non-blocking state query, cancellable
//! `connect`/`disconnect`/`send`, and an ordered event stream carrying state
//! changes, inbound messages and transport errors.
//!
//! - `stdio` - newline-delimited JSON over byte streams or a child process
//! - `http` - POST for outbound messages, an SSE GET stream for inbound ones
//! - `websocket` - one text frame per message, with keepalive pings
//! - `sse` - the line-oriented Server-Sent-Events parser used by `http`

pub mod http;
pub mod sse;
pub mod stdio;
pub mod websocket;

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};
use crate::mcp::events::EventEmitter;
use crate::mcp::protocol::Message;

pub use http::HttpTransport;
pub use sse::{SseEvent, SseParser};
pub use stdio::{CommandSpec, StdioTransport};
pub use websocket::{WebSocketAcceptPolicy, WebSocketTransport};

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl TransportState {
    /// States in which outbound messages are accepted.
    pub fn can_send(self) -> bool {
        matches!(self, Self::Connected | Self::Connecting)
    }

    /// States after which the connection is gone for good.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Something observable that happened on a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged {
        old: TransportState,
        new: TransportState,
    },
    MessageReceived(Message),
    Error(Arc<Error>),
}

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Current connection state.
    fn state(&self) -> TransportState;

    /// Open the connection: Disconnected → Connecting → Connected.
    async fn connect(&self, cancel: &CancellationToken) -> Result<()>;

    /// Close the connection. Disconnecting a closed transport succeeds.
    async fn disconnect(&self, cancel: &CancellationToken) -> Result<()>;

    /// Send one message to the peer.
    async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<()>;

    /// Subscribe to this transport's events.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
}

/// State and event plumbing shared by every transport implementation.
pub(crate) struct TransportCore {
    name: &'static str,
    state: Mutex<TransportState>,
    events: EventEmitter<TransportEvent>,
}

impl TransportCore {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(TransportState::Disconnected),
            events: EventEmitter::new(),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move to `new`, emitting a change event. Setting the same state is a no-op.
    pub(crate) fn set_state(&self, new: TransportState) {
        self.transition(|_| true, new);
    }

    /// Move to `new` only if the current state satisfies `allowed`.
    pub(crate) fn transition<F>(&self, allowed: F, new: TransportState) -> bool
    where
        F: FnOnce(TransportState) -> bool,
    {
        let mut changed = false;
        self.events.emit_with(|| {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            let old = *state;
            if old == new || !allowed(old) {
                return None;
            }
            *state = new;
            changed = true;
            trace!("{} transport: {} -> {}", self.name, old, new);
            Some(TransportEvent::StateChanged { old, new })
        });
        changed
    }

    pub(crate) fn emit_message(&self, message: Message) {
        self.events.emit(TransportEvent::MessageReceived(message));
    }

    pub(crate) fn emit_error(&self, error: Error) {
        self.events.emit(TransportEvent::Error(Arc::new(error)));
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Fail with "not connected" unless outbound messages are accepted.
    pub(crate) fn ensure_can_send(&self) -> Result<()> {
        let state = self.state();
        if state.can_send() {
            Ok(())
        } else {
            Err(Error::NotConnected(state.to_string()))
        }
    }
}

/// Race `fut` against `cancel`, settling with `Error::Cancelled` if it fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_permitted_states() {
        assert!(TransportState::Connected.can_send());
        assert!(TransportState::Connecting.can_send());
        assert!(!TransportState::Disconnected.can_send());
        assert!(!TransportState::Disconnecting.can_send());
        assert!(!TransportState::Error.can_send());
    }

    #[tokio::test]
    async fn test_core_state_changes_emit_once() {
        let core = TransportCore::new("test");
        let mut events = core.subscribe();

        core.set_state(TransportState::Connecting);
        core.set_state(TransportState::Connecting);
        core.set_state(TransportState::Connected);

        match events.recv().await {
            Some(TransportEvent::StateChanged { old, new }) => {
                assert_eq!(old, TransportState::Disconnected);
                assert_eq!(new, TransportState::Connecting);
            }
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await {
            Some(TransportEvent::StateChanged { old, new }) => {
                assert_eq!(old, TransportState::Connecting);
                assert_eq!(new, TransportState::Connected);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_guarded_transition() {
        let core = TransportCore::new("test");
        assert!(!core.transition(|s| s == TransportState::Connected, TransportState::Error));
        assert_eq!(core.state(), TransportState::Disconnected);
        assert!(core.transition(|s| s.is_closed(), TransportState::Connecting));
        assert_eq!(core.state(), TransportState::Connecting);
    }

    #[test]
    fn test_ensure_can_send() {
        let core = TransportCore::new("test");
        assert!(matches!(core.ensure_can_send(), Err(Error::NotConnected(_))));
        core.set_state(TransportState::Connected);
        assert!(core.ensure_can_send().is_ok());
    }

    #[tokio::test]
    async fn test_cancellable_settles_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = cancellable(&cancel, std::future::pending()).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
