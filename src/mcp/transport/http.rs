//! HTTP transport: outbound messages are POSTed, inbound ones arrive on a
//! long-lived Server-Sent-Events GET stream.
//!
//! The SSE stream runs in a worker task that reconnects after failures,
//! resuming with `Last-Event-ID`. A session id handed out by the server in
//! the `Mcp-Session-Id` header is echoed on every later request.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode, Url};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{join_url, HttpTransportConfig};
use crate::error::{Error, Result};
use crate::mcp::protocol::Message;
use crate::mcp::transport::sse::{decode_events, SseEvent, SseParser};
use crate::mcp::transport::{cancellable, Transport, TransportCore, TransportEvent, TransportState};

/// Header carrying the server-assigned session id.
pub const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Header used to resume an SSE stream.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// SSE event type that tells the client where to POST.
const ENDPOINT_EVENT: &str = "endpoint";

/// State shared between the transport handle and its stream worker.
struct HttpShared {
    core: TransportCore,
    client: reqwest::Client,
    config: HttpTransportConfig,
    session_id: Mutex<Option<String>>,
    last_event_id: Mutex<Option<String>>,
    post_endpoint: Mutex<Option<String>>,
    reconnect_delay: Mutex<Duration>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl HttpShared {
    fn sse_url(&self) -> String {
        join_url(&self.config.base_url, &self.config.sse_path)
    }

    fn post_url(&self) -> String {
        lock(&self.post_endpoint)
            .clone()
            .unwrap_or_else(|| join_url(&self.config.base_url, &self.config.post_path))
    }

    fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    fn last_event_id(&self) -> Option<String> {
        lock(&self.last_event_id).clone()
    }

    fn reconnect_delay(&self) -> Duration {
        *lock(&self.reconnect_delay)
    }

    /// Attach bearer token and session id.
    fn decorate(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.config.bearer_token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }
        request
    }

    /// Record a session id from response headers. With `overwrite` unset an
    /// already-known id is kept.
    fn capture_session_id(&self, headers: &HeaderMap, overwrite: bool) {
        let Some(value) = headers
            .get(SESSION_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            return;
        };

        let mut session_id = lock(&self.session_id);
        if overwrite || session_id.is_none() {
            if session_id.as_deref() != Some(value) {
                debug!("Using HTTP session id {}", value);
            }
            *session_id = Some(value.to_string());
        }
    }

    /// Resolve an `endpoint` event payload against the base URL.
    fn resolve_endpoint(&self, data: &str) -> Result<String> {
        let base = Url::parse(&self.config.base_url)
            .map_err(|e| Error::Config(format!("invalid base URL {}: {}", self.config.base_url, e)))?;
        let url = base
            .join(data.trim())
            .map_err(|e| Error::Protocol(format!("invalid endpoint {:?}: {}", data, e)))?;
        Ok(url.to_string())
    }

    /// Handle one event from the long-lived stream.
    fn dispatch(&self, event: SseEvent) {
        if let Some(id) = &event.id {
            *lock(&self.last_event_id) = Some(id.clone());
        }

        if event.event == ENDPOINT_EVENT {
            match self.resolve_endpoint(&event.data) {
                Ok(url) => {
                    debug!("Server moved POST endpoint to {}", url);
                    *lock(&self.post_endpoint) = Some(url);
                }
                Err(e) => {
                    warn!("Ignoring endpoint event: {}", e);
                    self.core.emit_error(e);
                }
            }
            return;
        }

        self.emit_data(&event.data);
    }

    fn emit_data(&self, data: &str) {
        trace!("Received: {}", data);
        match Message::parse(data) {
            Ok(message) => self.core.emit_message(message),
            Err(e) => {
                warn!("Failed to parse SSE message: {}", e);
                self.core.emit_error(e);
            }
        }
    }

    fn clear_session(&self) {
        *lock(&self.session_id) = None;
        *lock(&self.last_event_id) = None;
        *lock(&self.post_endpoint) = None;
        *lock(&self.reconnect_delay) = self.config.reconnect_delay();
    }
}

/// Copy of an error for reporting in two places.
fn duplicate(e: &Error) -> Error {
    match e {
        Error::HttpStatus { status, message } => Error::HttpStatus {
            status: *status,
            message: message.clone(),
        },
        Error::ConnectionClosed(reason) => Error::ConnectionClosed(reason.clone()),
        other => Error::Transport(other.to_string()),
    }
}

async fn status_error(response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let message = if body.trim().is_empty() {
        reason.to_string()
    } else {
        format!("{}: {}", reason, body.trim())
    };
    Error::HttpStatus {
        status: status.as_u16(),
        message,
    }
}

struct StreamWorker {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// HTTP+SSE client transport.
pub struct HttpTransport {
    shared: Arc<HttpShared>,
    worker: tokio::sync::Mutex<Option<StreamWorker>>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self> {
        Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid base URL {}: {}", config.base_url, e)))?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("mcp-wire/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let reconnect_delay = config.reconnect_delay();
        Ok(Self {
            shared: Arc::new(HttpShared {
                core: TransportCore::new("http"),
                client,
                config,
                session_id: Mutex::new(None),
                last_event_id: Mutex::new(None),
                post_endpoint: Mutex::new(None),
                reconnect_delay: Mutex::new(reconnect_delay),
            }),
            worker: tokio::sync::Mutex::new(None),
        })
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    /// Id of the last SSE event received.
    pub fn last_event_id(&self) -> Option<String> {
        self.shared.last_event_id()
    }

    /// URL that outbound messages are currently POSTed to.
    pub fn post_url(&self) -> String {
        self.shared.post_url()
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.shutdown.cancel();
        }
    }
}

/// Open the SSE stream once and pump it until it ends.
async fn stream_once(
    shared: &HttpShared,
    parser: &mut SseParser,
    ready: &mut Option<oneshot::Sender<Result<()>>>,
    attempts: &mut u32,
) -> Result<()> {
    let mut request = shared
        .client
        .get(shared.sse_url())
        .header(ACCEPT, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache");
    request = shared.decorate(request);
    if let Some(last_event_id) = shared.last_event_id() {
        request = request.header(LAST_EVENT_ID_HEADER, last_event_id);
    }

    let response = request.send().await?;
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    shared.capture_session_id(response.headers(), true);

    if !shared
        .core
        .transition(|s| s == TransportState::Connecting, TransportState::Connected)
        && shared.core.state() != TransportState::Connected
    {
        // Disconnect raced the handshake.
        return Ok(());
    }
    *attempts = 0;
    info!("SSE stream connected to {}", shared.sse_url());
    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(()));
    }

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for event in parser.feed(&chunk) {
            shared.dispatch(event);
        }
        if let Some(retry) = parser.take_retry() {
            debug!("Server set reconnect delay to {:?}", retry);
            *lock(&shared.reconnect_delay) = retry;
        }
    }
    Ok(())
}

/// Keep the SSE stream open, reconnecting per the configuration.
async fn run_event_stream(
    shared: Arc<HttpShared>,
    shutdown: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let mut ready = Some(ready);
    let mut parser = SseParser::new();
    let mut attempts: u32 = 0;

    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => return,
            outcome = stream_once(&shared, &mut parser, &mut ready, &mut attempts) => outcome,
        };
        if shutdown.is_cancelled() {
            return;
        }

        let error = match outcome {
            Ok(()) => Error::ConnectionClosed("SSE stream ended".to_string()),
            Err(e) => e,
        };
        parser.reset();

        let exhausted = shared
            .config
            .max_reconnect_attempts
            .is_some_and(|max| attempts >= max);
        if !shared.config.reconnect || exhausted || !error.is_retriable() {
            error!("SSE stream failed: {}", error);
            shared.core.emit_error(duplicate(&error));
            shared.core.transition(
                |s| !matches!(s, TransportState::Disconnecting | TransportState::Disconnected),
                TransportState::Error,
            );
            if let Some(tx) = ready.take() {
                let _ = tx.send(Err(error));
            }
            return;
        }

        attempts += 1;
        let delay = shared.reconnect_delay();
        warn!(
            "SSE stream lost ({}), reconnecting in {:?} (attempt {})",
            error, delay, attempts
        );
        shared.core.emit_error(error);
        shared
            .core
            .transition(|s| s == TransportState::Connected, TransportState::Connecting);

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn state(&self) -> TransportState {
        self.shared.core.state()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let mut worker = cancellable(cancel, async { Ok(self.worker.lock().await) }).await?;

        if let Some(existing) = worker.take() {
            if self.shared.core.state() == TransportState::Connected {
                *worker = Some(existing);
                return Ok(());
            }
            existing.shutdown.cancel();
            let _ = existing.handle.await;
        }

        self.shared.core.set_state(TransportState::Connecting);

        let shutdown = CancellationToken::new();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(run_event_stream(
            self.shared.clone(),
            shutdown.clone(),
            ready_tx,
        ));
        *worker = Some(StreamWorker {
            shutdown: shutdown.clone(),
            handle,
        });
        drop(worker);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            ready = ready_rx => ready.unwrap_or_else(|_| {
                Err(Error::ConnectionClosed("SSE stream stopped before connecting".to_string()))
            }),
        };

        if matches!(outcome, Err(Error::Cancelled)) {
            shutdown.cancel();
            self.shared.core.set_state(TransportState::Disconnected);
        }
        outcome
    }

    async fn disconnect(&self, cancel: &CancellationToken) -> Result<()> {
        let worker = cancellable(cancel, async { Ok(self.worker.lock().await.take()) }).await?;

        let mut result = Ok(());
        if let Some(worker) = worker {
            self.shared.core.set_state(TransportState::Disconnecting);
            worker.shutdown.cancel();
            result = cancellable(cancel, async {
                let _ = worker.handle.await;
                Ok(())
            })
            .await;
        }

        self.shared.clear_session();
        self.shared.core.set_state(TransportState::Disconnected);
        result
    }

    async fn send(&self, message: &Message, cancel: &CancellationToken) -> Result<()> {
        self.shared.core.ensure_can_send()?;

        let body = message.to_json();
        let url = self.shared.post_url();
        trace!("POST {}: {}", url, body);

        let mut request = self
            .shared
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body);
        if let Some(timeout) = self.shared.config.request_timeout() {
            request = request.timeout(timeout);
        }
        let request = self.shared.decorate(request);

        let response = cancellable(cancel, async { request.send().await.map_err(Error::from) }).await?;
        let status = response.status();
        self.shared.capture_session_id(response.headers(), false);

        if !status.is_success() {
            let e = status_error(response).await;
            debug!("POST to {} failed: {}", url, e);
            return Err(e);
        }
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let text = cancellable(cancel, async { response.text().await.map_err(Error::from) }).await?;
        if text.trim().is_empty() {
            return Ok(());
        }

        if content_type.starts_with("text/event-stream") {
            for event in decode_events(&text) {
                self.shared.emit_data(&event.data);
            }
        } else if content_type.starts_with("application/json") {
            self.shared.emit_data(text.trim());
        } else {
            debug!("Ignoring POST response body with content type {:?}", content_type);
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.shared.core.subscribe()
    }
}
