//! WebSocket transport: one JSON-RPC message per text frame.
//!
//! The client side dials a `ws://` URL; the server side wraps a stream that
//! has just been accepted, checking origin, bearer token and subprotocol
//! during the handshake. Both sides run a read task and an optional
//! keepalive task that sends ping frames.

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as ClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, ORIGIN, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::WebSocketConfig;
use crate::error::{Error, Result};
use crate::mcp::protocol::Message;
use crate::mcp::transport::{cancellable, Transport, TransportCore, TransportEvent, TransportState};

type WsError = tokio_tungstenite::tungstenite::Error;
type WsSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
type WsStream = Pin<Box<dyn Stream<Item = std::result::Result<WsMessage, WsError>> + Send>>;

/// Rules applied to an incoming WebSocket handshake.
#[derive(Debug, Clone, Default)]
pub struct WebSocketAcceptPolicy {
    /// Accepted `Origin` values; empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Required bearer token.
    pub bearer_token: Option<String>,
    /// Supported subprotocols in order of preference.
    pub subprotocols: Vec<String>,
    /// Keepalive ping interval for accepted connections.
    pub ping_interval: Option<Duration>,
}

/// Why a handshake was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: u16,
    pub reason: &'static str,
}

impl WebSocketAcceptPolicy {
    /// Check handshake headers, returning the selected subprotocol.
    pub fn evaluate(&self, headers: &HeaderMap) -> std::result::Result<Option<String>, Rejection> {
        if !self.allowed_origins.is_empty() {
            let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
            if !origin.is_some_and(|o| self.allowed_origins.iter().any(|a| a == o)) {
                return Err(Rejection {
                    status: 403,
                    reason: "origin not allowed",
                });
            }
        }

        if let Some(token) = &self.bearer_token {
            let presented = headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented != Some(token.as_str()) {
                return Err(Rejection {
                    status: 401,
                    reason: "missing or invalid bearer token",
                });
            }
        }

        let offered = headers
            .get_all(SEC_WEBSOCKET_PROTOCOL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>();

        Ok(offered
            .into_iter()
            .find(|p| self.subprotocols.iter().any(|s| s == p))
            .map(str::to_string))
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| Error::Config(format!("invalid header value {:?}: {}", value, e)))
}

fn client_request(config: &WebSocketConfig) -> Result<ClientRequest> {
    let mut request = config.endpoint().into_client_request()?;
    let headers = request.headers_mut();
    if !config.subprotocols.is_empty() {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, header_value(&config.subprotocols.join(", "))?);
    }
    if let Some(token) = &config.bearer_token {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
    }
    if let Some(origin) = &config.origin {
        headers.insert(ORIGIN, header_value(origin)?);
    }
    Ok(request)
}

enum WsSource {
    /// Dial out on every connect.
    Client(WebSocketConfig),
    /// A server-accepted socket; usable for exactly one connection.
    Accepted(Option<(WsSink, WsStream)>),
}

struct Connection {
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    shutdown: CancellationToken,
    reader: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

/// WebSocket transport for MCP.
pub struct WebSocketTransport {
    core: Arc<TransportCore>,
    source: Mutex<WsSource>,
    ping_interval: Option<Duration>,
    subprotocol: Mutex<Option<String>>,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl WebSocketTransport {
    /// Client transport dialing `config.endpoint()`.
    pub fn new(config: WebSocketConfig) -> Self {
        let ping_interval = config.ping_interval();
        Self {
            core: Arc::new(TransportCore::new("websocket")),
            source: Mutex::new(WsSource::Client(config)),
            ping_interval,
            subprotocol: Mutex::new(None),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Complete a server-side handshake on `stream`.
    ///
    /// The returned transport is Disconnected until `connect` starts its
    /// read and keepalive tasks.
    pub async fn accept<S>(stream: S, policy: &WebSocketAcceptPolicy) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut selected = None;
        let callback = |request: &Request, mut response: Response| {
            match policy.evaluate(request.headers()) {
                Ok(subprotocol) => {
                    if let Some(protocol) = &subprotocol {
                        if let Ok(value) = HeaderValue::from_str(protocol) {
                            response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                        }
                    }
                    selected = subprotocol;
                    Ok(response)
                }
                Err(rejection) => {
                    warn!(
                        "Rejecting WebSocket handshake from {}: {}",
                        request.uri(),
                        rejection.reason
                    );
                    let mut refused = ErrorResponse::new(Some(rejection.reason.to_string()));
                    *refused.status_mut() =
                        StatusCode::from_u16(rejection.status).unwrap_or(StatusCode::FORBIDDEN);
                    Err(refused)
                }
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        debug!("Accepted WebSocket connection (subprotocol {:?})", selected);

        let (sink, stream) = ws.split();
        Ok(Self {
            core: Arc::new(TransportCore::new("websocket")),
            source: Mutex::new(WsSource::Accepted(Some((Box::pin(sink), Box::pin(stream))))),
            ping_interval: policy.ping_interval,
            subprotocol: Mutex::new(selected),
            connection: tokio::sync::Mutex::new(None),
        })
    }

    /// Subprotocol agreed during the handshake.
    pub fn subprotocol(&self) -> Option<String> {
        self.subprotocol
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<(WsSink, WsStream)> {
        let config = {
            let mut source = self.source.lock().unwrap_or_else(|p| p.into_inner());
            match &mut *source {
                WsSource::Accepted(streams) => {
                    return streams.take().ok_or_else(|| {
                        Error::Transport("accepted socket was already used by an earlier connection".to_string())
                    });
                }
                WsSource::Client(config) => config.clone(),
            }
        };

        let request = client_request(&config)?;
        debug!("Connecting WebSocket to {}", request.uri());
        let (ws, response) = cancellable(cancel, async {
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(Error::from)
        })
        .await?;

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        *self.subprotocol.lock().unwrap_or_else(|p| p.into_inner()) = negotiated;

        info!("WebSocket connected to {}", config.endpoint());
        let (sink, stream) = ws.split();
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Read frames until close, a read error, or shutdown.
async fn read_loop(core: Arc<TransportCore>, mut stream: WsStream, shutdown: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(WsMessage::Text(text))) => {
                let text = text.as_str();
                trace!("Received: {}", text);
                match Message::parse(text) {
                    Ok(message) => core.emit_message(message),
                    Err(e) => {
                        warn!("Failed to parse message: {}", e);
                        core.emit_error(e);
                    }
                }
            }
            Some(Ok(WsMessage::Binary(data))) => {
                warn!("Dropping binary frame of {} bytes", data.len());
                core.emit_error(Error::Protocol(format!(
                    "binary frames are not supported ({} bytes)",
                    data.len()
                )));
            }
            Some(Ok(WsMessage::Close(frame))) => {
                debug!("WebSocket closed by peer: {:?}", frame);
                core.transition(|s| s != TransportState::Disconnecting, TransportState::Disconnected);
                return;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!("WebSocket read error: {}", e);
                core.emit_error(e.into());
                core.transition(|s| s != TransportState::Disconnecting, TransportState::Error);
                return;
            }
            None => {
                debug!("WebSocket stream ended");
                core.transition(|s| s != TransportState::Disconnecting, TransportState::Disconnected);
                return;
            }
        }
    }
}

async fn keepalive_loop(
    core: Arc<TransportCore>,
    sink: Arc<tokio::sync::Mutex<WsSink>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let mut sink = sink.lock().await;
        if let Err(e) = sink.send(WsMessage::Ping(Default::default())).await {
            warn!("WebSocket keepalive ping failed: {}", e);
            core.emit_error(e.into());
            return;
        }
        trace!("Sent keepalive ping");
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn state(&self) -> TransportState {
        self.core.state()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let mut guard = cancellable(cancel, async { Ok(self.connection.lock().await) }).await?;

        if let Some(stale) = guard.take() {
            if self.core.state() == TransportState::Connected {
                *guard = Some(stale);
                return Ok(());
            }
            stale.shutdown.cancel();
            let _ = stale.reader.await;
        }

        self.core.set_state(TransportState::Connecting);
        let (sink, stream) = match self.open(cancel).await {
            Ok(halves) => halves,
            Err(Error::Cancelled) => {
                self.core.set_state(TransportState::Disconnected);
                return Err(Error::Cancelled);
            }
            Err(e) => {
                error!("WebSocket connect failed: {}", e);
                self.core.set_state(TransportState::Error);
                return Err(e);
            }
        };

        let sink = Arc::new(tokio::sync::Mutex::new(sink));
        let shutdown = CancellationToken::new();
        // Connected must land before the reader can observe a close frame.
        self.core.set_state(TransportState::Connected);
        let reader = tokio::spawn(read_loop(self.core.clone(), stream, shutdown.clone()));
        let keepalive = self.ping_interval.map(|interval| {
            tokio::spawn(keepalive_loop(
                self.core.clone(),
                sink.clone(),
                interval,
                shutdown.clone(),
            ))
        });

        *guard = Some(Connection {
            sink,
            shutdown,
            reader,
            keepalive,
        });
        Ok(())
    }

    async fn disconnect(&self, cancel: &CancellationToken) -> Result<()> {
        let conn = cancellable(cancel, async { Ok(self.connection.lock().await.take()) }).await?;

        let Some(conn) = conn else {
            self.core.set_state(TransportState::Disconnected);
            return Ok(());
        };

        self.core.set_state(TransportState::Disconnecting);
        conn.shutdown.cancel();
        if let Some(keepalive) = conn.keepalive {
            let _ = keepalive.await;
        }

        let closed = cancellable(cancel, async {
            let mut sink = conn.sink.lock().await;
            if let Err(e) = sink.close().await {
                debug!("Error while closing WebSocket: {}", e);
            }
            Ok(())
        })
        .await;
        let _ = conn.reader.await;

        self.core.set_state(TransportState::Disconnected);
        closed
    }

    async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        self.core.ensure_can_send()?;
        let text = message.to_json();

        let sink = {
            let guard = cancellable(cancel, async { Ok(self.connection.lock().await) }).await?;
            guard
                .as_ref()
                .map(|conn| conn.sink.clone())
                .ok_or_else(|| Error::NotConnected(self.core.state().to_string()))?
        };
        let mut sink = cancellable(cancel, async { Ok(sink.lock().await) }).await?;

        trace!("Sending: {}", text);
        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
            error!("Error writing WebSocket frame: {}", e);
            self.core.emit_error(Error::Transport(e.to_string()));
            return Err(e.into());
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

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                tokio_tungstenite::tungstenite::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_open_policy_accepts_anything() {
        let policy = WebSocketAcceptPolicy::default();
        assert_eq!(policy.evaluate(&HeaderMap::new()), Ok(None));
    }

    #[test]
    fn test_origin_allow_list() {
        let policy = WebSocketAcceptPolicy {
            allowed_origins: vec!["https://app.example.com".to_string()],
            ..Default::default()
        };

        assert!(policy
            .evaluate(&headers(&[("origin", "https://app.example.com")]))
            .is_ok());
        assert_eq!(
            policy
                .evaluate(&headers(&[("origin", "https://evil.example.com")]))
                .unwrap_err()
                .status,
            403
        );
        assert_eq!(policy.evaluate(&HeaderMap::new()).unwrap_err().status, 403);
    }

    #[test]
    fn test_bearer_token_gate() {
        let policy = WebSocketAcceptPolicy {
            bearer_token: Some("s3cret".to_string()),
            ..Default::default()
        };

        assert!(policy
            .evaluate(&headers(&[("authorization", "Bearer s3cret")]))
            .is_ok());
        assert_eq!(
            policy
                .evaluate(&headers(&[("authorization", "Bearer wrong")]))
                .unwrap_err()
                .status,
            401
        );
        assert_eq!(policy.evaluate(&HeaderMap::new()).unwrap_err().status, 401);
    }

    #[test]
    fn test_subprotocol_selection() {
        let policy = WebSocketAcceptPolicy {
            subprotocols: vec!["mcp".to_string(), "jsonrpc".to_string()],
            ..Default::default()
        };

        let selected = policy
            .evaluate(&headers(&[("sec-websocket-protocol", "chat, jsonrpc, mcp")]))
            .unwrap();
        assert_eq!(selected.as_deref(), Some("jsonrpc"));

        let none = policy
            .evaluate(&headers(&[("sec-websocket-protocol", "chat")]))
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_client_request_headers() {
        let config = WebSocketConfig {
            url: "ws://localhost:9000".to_string(),
            path: "/mcp".to_string(),
            subprotocols: vec!["mcp".to_string()],
            bearer_token: Some("tok".to_string()),
            origin: Some("https://app.example.com".to_string()),
            ..Default::default()
        };

        let request = client_request(&config).unwrap();
        assert_eq!(request.uri().path(), "/mcp");
        assert_eq!(request.headers()[SEC_WEBSOCKET_PROTOCOL], "mcp");
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer tok");
        assert_eq!(request.headers()[ORIGIN], "https://app.example.com");
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = WebSocketTransport::new(WebSocketConfig::default());
        let result = transport
            .send(&Message::notification("x", None), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::NotConnected(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_peer_closing_at_once_leaves_transport_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let transport = WebSocketTransport::new(WebSocketConfig::new(url));
        let mut events = transport.subscribe();
        transport.connect(&CancellationToken::new()).await.unwrap();

        let mut seen = Vec::new();
        while seen.last() != Some(&TransportState::Disconnected) {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap();
            if let Some(TransportEvent::StateChanged { new, .. }) = event {
                seen.push(new);
            }
        }
        assert_eq!(
            seen,
            vec![
                TransportState::Connecting,
                TransportState::Connected,
                TransportState::Disconnected,
            ]
        );
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_sets_error_state() {
        let transport = WebSocketTransport::new(WebSocketConfig::new("ws://127.0.0.1:9"));
        let result = transport.connect(&CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(transport.state(), TransportState::Error);
    }
}
