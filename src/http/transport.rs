//! Server-side transport for one HTTP/SSE client.
//!
//! Inbound messages arrive through POST handlers and are injected with
//! [`HttpSessionTransport::deliver`]. Outbound messages are numbered and kept
//! in a bounded replay buffer, then forwarded to whichever SSE stream is
//! currently attached.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Error, Result};
use crate::mcp::protocol::Message;
use crate::mcp::transport::{Transport, TransportCore, TransportEvent, TransportState};

/// One numbered outbound SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub id: u64,
    pub data: String,
}

struct Outbound {
    next_id: u64,
    buffer: VecDeque<OutboundEvent>,
    stream: Option<mpsc::UnboundedSender<OutboundEvent>>,
}

/// Transport whose peer is reached through HTTP requests.
pub struct HttpSessionTransport {
    core: TransportCore,
    outbound: Mutex<Outbound>,
    capacity: usize,
}

impl HttpSessionTransport {
    /// Create a transport keeping up to `capacity` events for replay.
    pub fn new(capacity: usize) -> Self {
        Self {
            core: TransportCore::new("http-session"),
            outbound: Mutex::new(Outbound {
                next_id: 1,
                buffer: VecDeque::new(),
                stream: None,
            }),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Attach a new SSE stream, replacing any previous one.
    ///
    /// Buffered events with an id above `last_event_id` are queued on the new
    /// stream before anything sent afterwards.
    pub fn attach(&self, last_event_id: Option<u64>) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut outbound = self.lock();
        if let Some(last) = last_event_id {
            for event in outbound.buffer.iter().filter(|e| e.id > last) {
                let _ = tx.send(event.clone());
            }
        }
        outbound.stream = Some(tx);
        rx
    }

    /// Whether an SSE stream is attached and still being read.
    pub fn is_attached(&self) -> bool {
        self.lock()
            .stream
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Number of events held for replay.
    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Hand one inbound message to the session.
    pub fn deliver(&self, message: Message) -> Result<()> {
        let state = self.core.state();
        if state.is_closed() {
            return Err(Error::NotConnected(state.to_string()));
        }
        trace!("<- {}", message.kind());
        self.core.emit_message(message);
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpSessionTransport {
    fn state(&self) -> TransportState {
        self.core.state()
    }

    async fn connect(&self, _cancel: &CancellationToken) -> Result<()> {
        if !self
            .core
            .transition(|s| s.is_closed(), TransportState::Connecting)
        {
            return Err(Error::AlreadyRunning("http session".to_string()));
        }
        self.core.set_state(TransportState::Connected);
        Ok(())
    }

    async fn disconnect(&self, _cancel: &CancellationToken) -> Result<()> {
        if self.core.state().is_closed() {
            return Ok(());
        }
        self.core.set_state(TransportState::Disconnecting);
        self.lock().stream = None;
        self.core.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.core.ensure_can_send()?;

        let data = message.to_json();
        let mut outbound = self.lock();
        let event = OutboundEvent {
            id: outbound.next_id,
            data,
        };
        outbound.next_id += 1;
        outbound.buffer.push_back(event.clone());
        while outbound.buffer.len() > self.capacity {
            outbound.buffer.pop_front();
        }
        let delivered = outbound
            .stream
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false);
        if !delivered {
            // Kept for replay when the client re-attaches.
            outbound.stream = None;
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.core.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn connected(capacity: usize) -> HttpSessionTransport {
        let transport = HttpSessionTransport::new(capacity);
        transport.connect(&CancellationToken::new()).await.unwrap();
        transport
    }

    #[tokio::test]
    async fn test_events_are_numbered_in_order() {
        let transport = connected(8).await;
        let mut stream = transport.attach(None);
        let cancel = CancellationToken::new();

        transport
            .send(&Message::notification("a", None), &cancel)
            .await
            .unwrap();
        transport
            .send(&Message::notification("b", None), &cancel)
            .await
            .unwrap();

        let first = stream.recv().await.unwrap();
        let second = stream.recv().await.unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert!(first.data.contains("\"a\""));
    }

    #[tokio::test]
    async fn test_reattach_replays_after_last_event_id() {
        let transport = connected(8).await;
        let cancel = CancellationToken::new();
        for i in 0..4 {
            transport
                .send(&Message::notification("n", Some(json!({ "i": i }))), &cancel)
                .await
                .unwrap();
        }

        let mut stream = transport.attach(Some(2));
        assert_eq!(stream.recv().await.unwrap().id, 3);
        assert_eq!(stream.recv().await.unwrap().id, 4);
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replay_buffer_is_bounded() {
        let transport = connected(2).await;
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            transport
                .send(&Message::notification("n", None), &cancel)
                .await
                .unwrap();
        }
        assert_eq!(transport.buffered(), 2);

        let mut stream = transport.attach(Some(0));
        assert_eq!(stream.recv().await.unwrap().id, 4);
        assert_eq!(stream.recv().await.unwrap().id, 5);
    }

    #[tokio::test]
    async fn test_deliver_emits_inbound_message() {
        let transport = connected(8).await;
        let mut events = transport.subscribe();

        tokio_test::assert_ok!(transport.deliver(Message::request(1, "ping", None)));
        match events.recv().await {
            Some(TransportEvent::MessageReceived(m)) => assert_eq!(m.method(), Some("ping")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_connect_twice_fails() {
        tokio_test::block_on(async {
            let transport = HttpSessionTransport::new(4);
            let cancel = CancellationToken::new();
            tokio_test::assert_ok!(transport.connect(&cancel).await);
            tokio_test::assert_err!(transport.connect(&cancel).await);
            assert_eq!(transport.state(), TransportState::Connected);
        });
    }

    #[tokio::test]
    async fn test_disconnect_detaches_stream() {
        let transport = connected(8).await;
        let mut stream = transport.attach(None);
        assert!(transport.is_attached());

        transport.disconnect(&CancellationToken::new()).await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
        assert!(stream.recv().await.is_none());
        assert!(matches!(
            transport.deliver(Message::notification("x", None)),
            Err(Error::NotConnected(_))
        ));
        assert!(matches!(
            transport
                .send(&Message::notification("x", None), &CancellationToken::new())
                .await,
            Err(Error::NotConnected(_))
        ));
    }
}
