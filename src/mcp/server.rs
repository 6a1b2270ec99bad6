//! MCP server session.
//!
//! One [`ServerSession`] answers one client over one transport. It responds
//! to the handshake, answers `ping`, and hands every other request to the
//! configured [`RequestHandler`]. Each request runs in its own task with a
//! cancellation token that `notifications/cancelled` trips.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::mcp::capabilities::{ClientCapabilities, ServerCapabilities};
use crate::mcp::events::EventEmitter;
use crate::mcp::handler::{parse_params, RequestContext, RequestHandler};
use crate::mcp::protocol::*;
use crate::mcp::session::{Session, SessionEvent, SessionState};
use crate::mcp::transport::{Transport, TransportEvent, TransportState};
use crate::metrics::{Metrics, Timer};

/// Settings shared by every session a server creates.
#[derive(Clone)]
pub struct ServerOptions {
    pub identity: Implementation,
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
    pub handler: Arc<dyn RequestHandler>,
    pub metrics: Arc<Metrics>,
}

impl ServerOptions {
    pub fn new(identity: Implementation, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            identity,
            capabilities: ServerCapabilities::default(),
            instructions: None,
            handler,
            metrics: Metrics::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ServerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Session lifecycle events published by a multi-client server.
#[derive(Clone)]
pub enum ServerEvent {
    SessionCreated(Arc<ServerSession>),
    SessionClosed(Arc<ServerSession>),
}

impl ServerEvent {
    pub fn session(&self) -> &Arc<ServerSession> {
        match self {
            Self::SessionCreated(session) | Self::SessionClosed(session) => session,
        }
    }
}

impl std::fmt::Debug for ServerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionCreated(s) => f.debug_tuple("SessionCreated").field(&s.id()).finish(),
            Self::SessionClosed(s) => f.debug_tuple("SessionClosed").field(&s.id()).finish(),
        }
    }
}

/// Live server sessions keyed by id.
///
/// Removal is the single point that announces `SessionClosed`, so a session
/// is reported closed exactly once however its end is observed.
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<ServerSession>>>,
    events: EventEmitter<ServerEvent>,
}

impl SessionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            events: EventEmitter::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ServerSession>>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<ServerSession>> {
        self.lock().get(id).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ServerSession>> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn insert(&self, session: Arc<ServerSession>) {
        self.lock().insert(session.id().to_string(), session.clone());
        self.events.emit(ServerEvent::SessionCreated(session));
    }

    /// Forget a session, announcing it only if it was still tracked.
    pub(crate) fn remove(&self, id: &str) -> Option<Arc<ServerSession>> {
        let removed = self.lock().remove(id);
        if let Some(session) = &removed {
            self.events.emit(ServerEvent::SessionClosed(session.clone()));
        }
        removed
    }

    /// Close every tracked session.
    pub(crate) async fn close_all(&self) {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        for id in ids {
            if let Some(session) = self.get(&id) {
                if let Err(e) = session.close(&CancellationToken::new()).await {
                    debug!("Error closing session {}: {}", id, e);
                }
            }
            self.remove(&id);
        }
    }

    /// Take every session out without announcing, for teardown in `Drop`.
    pub(crate) fn drain(&self) -> Vec<Arc<ServerSession>> {
        self.lock().drain().map(|(_, s)| s).collect()
    }
}

/// Wait until a session's event stream reports a closed state or ends.
pub(crate) async fn until_closed(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(SessionEvent::StateChanged { new, .. }) = events.recv().await {
        if new.is_closed() {
            return;
        }
    }
}

/// Server end of one MCP connection.
pub struct ServerSession {
    id: String,
    session: Session,
    options: ServerOptions,
    client_capabilities: OnceLock<ClientCapabilities>,
    /// Active requests and their cancellation tokens.
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ServerSession {
    /// Create a session over `transport`. Call [`start`](Self::start) to run it.
    pub fn new(transport: Arc<dyn Transport>, options: ServerOptions) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            session: Session::new(transport, options.identity.clone()),
            options,
            client_capabilities: OnceLock::new(),
            in_flight: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            pump: Mutex::new(None),
        })
    }

    /// Unique id of this session.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.session.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Identity the client reported during the handshake.
    pub fn client_info(&self) -> Option<&Implementation> {
        self.session.remote_identity()
    }

    pub fn client_capabilities(&self) -> Option<&ClientCapabilities> {
        self.client_capabilities.get()
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.session.protocol_version()
    }

    /// Number of requests currently being handled.
    pub fn in_flight_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Check if a request is still active.
    pub fn is_active(&self, id: &RequestId) -> bool {
        self.lock_in_flight().contains_key(id)
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Connect the transport and start answering the client.
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Protocol(format!("session {} already started", self.id)));
        }

        let events = self.session.transport().subscribe();
        self.session.set_state(SessionState::Connecting);

        if self.session.transport().state() != TransportState::Connected {
            if let Err(e) = self.session.transport().connect(cancel).await {
                error!("Session {} failed to connect: {}", self.id, e);
                self.session.set_state(SessionState::Error);
                self.closed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }

        self.options.metrics.session_opened();
        self.session.set_state(SessionState::Initializing);
        debug!("Session {} waiting for initialize", self.id);

        let handle = tokio::spawn(pump(
            Arc::downgrade(self),
            events,
            self.shutdown.clone(),
        ));
        *self.pump.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    /// Wait until the session reaches Disconnected or Error.
    pub async fn wait_closed(&self) {
        let mut events = self.subscribe();
        if self.state().is_closed() {
            return;
        }
        until_closed(&mut events).await;
    }

    /// Close the session and its transport. Closing twice is a no-op.
    pub async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.session
            .transition(|s| !s.is_closed(), SessionState::Closing);
        self.shutdown.cancel();
        let pump = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        let result = self.session.transport().disconnect(cancel).await;
        self.finish(TransportState::Disconnected);
        result
    }

    /// Send a request to the client and wait for the reply.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.ensure_ready()?;
        self.session.request(method, params, cancel).await
    }

    /// Send a notification to the client.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.session.notify(method, params).await
    }

    /// Send a `notifications/message` log entry to the client.
    pub async fn log(&self, level: &str, logger: Option<&str>, data: Value) -> Result<()> {
        let mut params = json!({ "level": level, "data": data });
        if let Some(logger) = logger {
            params["logger"] = Value::String(logger.to_string());
        }
        self.notify(methods::MESSAGE, Some(params)).await
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.session.state() {
            SessionState::Ready => Ok(()),
            state => Err(Error::Protocol(format!("session is {}, not Ready", state))),
        }
    }

    /// Tear down once. Fails pending requests and cancels in-flight handlers.
    fn finish(&self, transport_state: TransportState) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        self.lock_in_flight().clear();
        self.session.on_transport_closed(transport_state);
        if self.started.load(Ordering::SeqCst) {
            self.options.metrics.session_closed();
        }
        info!("Session {} closed", self.id);
    }

    async fn reply(&self, message: Message) {
        if let Err(e) = self.session.send(&message, &CancellationToken::new()).await {
            warn!("Session {} failed to send reply: {}", self.id, e);
        }
    }

    async fn handle_message(self: &Arc<Self>, message: Message) {
        match message {
            Message::Request(req) => self.handle_request(req).await,
            Message::Notification(notif) => self.handle_notification(notif).await,
            reply @ (Message::Response(_) | Message::Error(_)) => {
                self.session.route_response(reply);
            }
        }
    }

    /// Handle a JSON-RPC request.
    async fn handle_request(self: &Arc<Self>, req: JsonRpcRequest) {
        debug!("Handling request: {} (id: {})", req.method, req.id);

        match req.method.as_str() {
            methods::INITIALIZE => {
                let reply = match self.handle_initialize(req.params) {
                    Ok(result) => Message::response(req.id, result),
                    Err(e) => {
                        warn!("Rejected initialize on session {}: {}", self.id, e);
                        Message::error(Some(req.id), e.to_rpc_error())
                    }
                };
                self.reply(reply).await;
            }
            methods::PING => self.reply(Message::response(req.id, json!({}))).await,
            _ if self.session.state() != SessionState::Ready => {
                let error = JsonRpcError::new(
                    error_codes::INVALID_REQUEST,
                    format!("Session not initialized; cannot handle {}", req.method),
                );
                self.reply(Message::error(Some(req.id), error)).await;
            }
            _ => self.dispatch(req),
        }
    }

    /// Handle initialize request.
    fn handle_initialize(&self, params: Option<Value>) -> Result<Value> {
        let state = self.session.state();
        if state != SessionState::Initializing {
            return Err(Error::Protocol(format!(
                "initialize received while session is {}",
                state
            )));
        }

        let params: InitializeParams = parse_params(params)?;
        let version = if is_supported_version(&params.protocol_version) {
            params.protocol_version.clone()
        } else {
            debug!(
                "Client requested unsupported protocol {}, offering {}",
                params.protocol_version, MCP_VERSION
            );
            MCP_VERSION.to_string()
        };

        self.session.set_remote_identity(params.client_info.clone())?;
        self.session.set_protocol_version(version.clone())?;
        let _ = self.client_capabilities.set(params.capabilities);

        info!(
            "Session {}: client {} {} (protocol {})",
            self.id, params.client_info.name, params.client_info.version, version
        );

        let result = InitializeResult {
            protocol_version: version,
            capabilities: self.options.capabilities.clone(),
            server_info: self.session.local_identity(),
            instructions: self.options.instructions.clone(),
        };
        Ok(serde_json::to_value(result)?)
    }

    /// Run a request on its own task.
    fn dispatch(self: &Arc<Self>, req: JsonRpcRequest) {
        let token = self.shutdown.child_token();
        {
            let mut in_flight = self.lock_in_flight();
            if in_flight.contains_key(&req.id) {
                drop(in_flight);
                let this = self.clone();
                tokio::spawn(async move {
                    let error = JsonRpcError::new(
                        error_codes::INVALID_REQUEST,
                        format!("Request id {} is already in flight", req.id),
                    );
                    this.reply(Message::error(Some(req.id), error)).await;
                });
                return;
            }
            in_flight.insert(req.id.clone(), token.clone());
        }

        let this = self.clone();
        tokio::spawn(async move {
            let metrics = this.options.metrics.clone();
            metrics.inc_requests();
            let timer = Timer::start();

            let ctx = RequestContext {
                session_id: this.id.clone(),
                request_id: req.id.clone(),
                method: req.method.clone(),
                cancel: token.clone(),
            };
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = this.options.handler.handle_request(ctx, req.params) => Some(result),
            };
            metrics.observe_request(&timer);

            let still_active = this.lock_in_flight().remove(&req.id).is_some();
            match outcome {
                None => debug!("Request {} cancelled, suppressing response", req.id),
                Some(_) if !still_active => {
                    debug!("Request {} finished after cancellation", req.id)
                }
                Some(Ok(result)) => {
                    metrics.inc_success();
                    this.reply(Message::response(req.id, result)).await;
                }
                Some(Err(e)) => {
                    metrics.inc_failed();
                    debug!("Request {} ({}) failed: {}", req.id, req.method, e);
                    this.reply(Message::error(Some(req.id), e.to_rpc_error()))
                        .await;
                }
            }
        });
    }

    /// Handle a notification.
    async fn handle_notification(&self, notif: JsonRpcNotification) {
        debug!("Handling notification: {}", notif.method);

        match notif.method.as_str() {
            methods::INITIALIZED => {
                if self
                    .session
                    .transition(|s| s == SessionState::Initializing, SessionState::Ready)
                {
                    info!("Session {} ready", self.id);
                } else {
                    warn!(
                        "Ignoring initialized notification while session is {}",
                        self.session.state()
                    );
                }
            }
            methods::CANCELLED => {
                let params: CancelledParams = match parse_params(notif.params) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!("Malformed cancellation: {}", e);
                        return;
                    }
                };
                let token = self.lock_in_flight().remove(&params.request_id);
                if let Some(token) = token {
                    info!(
                        "Cancelling request {}: {}",
                        params.request_id,
                        params.reason.as_deref().unwrap_or("no reason given")
                    );
                    self.options.metrics.inc_cancelled();
                    token.cancel();
                }
            }
            _ => {
                self.options.metrics.inc_notifications();
                self.options
                    .handler
                    .handle_notification(&notif.method, notif.params)
                    .await;
            }
        }
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Route transport events into the session until the transport closes.
async fn pump(
    session: Weak<ServerSession>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(event) = event else { return };
        let Some(this) = session.upgrade() else { return };

        match event {
            TransportEvent::MessageReceived(message) => this.handle_message(message).await,
            TransportEvent::StateChanged { new, .. } if new.is_closed() => {
                debug!("Transport for session {} is {}", this.id, new);
                this.finish(new);
                return;
            }
            TransportEvent::StateChanged { .. } => {}
            TransportEvent::Error(e) => debug!("Transport error on session {}: {}", this.id, e),
        }
    }
}
