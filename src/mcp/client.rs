//! MCP client session.
//!
//! [`ClientSession::connect`] opens the transport and runs the handshake:
//! `initialize` with the requested protocol version, the client identity and
//! capabilities, then `notifications/initialized` once the server's reply is
//! validated. After that the session is Ready for requests.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::mcp::capabilities::{ClientCapabilities, ServerCapabilities};
use crate::mcp::events::EventEmitter;
use crate::mcp::handler::{RequestContext, RequestHandler};
use crate::mcp::protocol::*;
use crate::mcp::session::{Session, SessionEvent, SessionState};
use crate::mcp::transport::{Transport, TransportEvent, TransportState};

/// Settings for the client end of a connection.
#[derive(Clone)]
pub struct ClientOptions {
    pub identity: Implementation,
    pub capabilities: ClientCapabilities,
    /// Protocol version requested in `initialize`.
    pub protocol_version: String,
    /// Answers requests the server sends to the client.
    pub handler: Option<Arc<dyn RequestHandler>>,
}

impl ClientOptions {
    pub fn new(identity: Implementation) -> Self {
        Self {
            identity,
            capabilities: ClientCapabilities::default(),
            protocol_version: MCP_VERSION.to_string(),
            handler: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

/// Client end of one MCP connection. Each session connects once.
pub struct ClientSession {
    session: Session,
    options: ClientOptions,
    server_capabilities: OnceLock<ServerCapabilities>,
    instructions: OnceLock<String>,
    notifications: EventEmitter<JsonRpcNotification>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(transport, options.identity.clone()),
            options,
            server_capabilities: OnceLock::new(),
            instructions: OnceLock::new(),
            notifications: EventEmitter::new(),
            shutdown: CancellationToken::new(),
            pump: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        self.session.subscribe()
    }

    /// Notifications sent by the server, in arrival order.
    pub fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<JsonRpcNotification> {
        self.notifications.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.session.remote_identity()
    }

    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.server_capabilities.get()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.get().map(String::as_str)
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.session.protocol_version()
    }

    /// Connect the transport and complete the handshake.
    pub async fn connect(self: &Arc<Self>, cancel: &CancellationToken) -> Result<InitializeResult> {
        let state = self.session.state();
        if state != SessionState::Disconnected || self.session.remote_identity().is_some() {
            return Err(Error::Protocol(format!(
                "client session cannot connect while {}",
                state
            )));
        }

        self.session.set_state(SessionState::Connecting);
        let transport = self.session.transport().clone();
        let events = transport.subscribe();

        if let Err(e) = transport.connect(cancel).await {
            error!("Transport connect failed: {}", e);
            self.fail(&e);
            return Err(e);
        }

        let handle = tokio::spawn(pump(Arc::downgrade(self), events, self.shutdown.clone()));
        *self.pump.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        self.session.set_state(SessionState::Initializing);
        match self.handshake(cancel).await {
            Ok(result) => {
                self.session
                    .transition(|s| s == SessionState::Initializing, SessionState::Ready);
                info!(
                    "Connected to {} {} (protocol {})",
                    result.server_info.name, result.server_info.version, result.protocol_version
                );
                Ok(result)
            }
            Err(e) => {
                error!("Handshake failed: {}", e);
                self.shutdown.cancel();
                let _ = transport.disconnect(&CancellationToken::new()).await;
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn handshake(&self, cancel: &CancellationToken) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: self.options.protocol_version.clone(),
            capabilities: self.options.capabilities.clone(),
            client_info: self.session.local_identity(),
        };

        let value = self
            .session
            .request(methods::INITIALIZE, Some(serde_json::to_value(params)?), cancel)
            .await?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("Malformed initialize result: {}", e)))?;

        if !is_supported_version(&result.protocol_version) {
            return Err(Error::Protocol(format!(
                "Server selected unsupported protocol version {}",
                result.protocol_version
            )));
        }

        self.session.set_remote_identity(result.server_info.clone())?;
        self.session
            .set_protocol_version(result.protocol_version.clone())?;
        let _ = self.server_capabilities.set(result.capabilities.clone());
        if let Some(instructions) = &result.instructions {
            let _ = self.instructions.set(instructions.clone());
        }

        self.session.notify(methods::INITIALIZED, None).await?;
        Ok(result)
    }

    fn fail(&self, e: &Error) {
        let state = if matches!(e, Error::Cancelled) {
            SessionState::Disconnected
        } else {
            SessionState::Error
        };
        self.session.set_state(state);
        self.session
            .cancel_all_pending_requests("connection failed");
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.session.state() {
            SessionState::Ready => Ok(()),
            state => Err(Error::Protocol(format!("session is {}, not Ready", state))),
        }
    }

    /// Send a request and wait for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.ensure_ready()?;
        self.session.request(method, params, cancel).await
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_ready()?;
        self.session.notify(method, params).await
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self, cancel: &CancellationToken) -> Result<()> {
        self.request(methods::PING, None, cancel).await.map(|_| ())
    }

    /// Close the connection and fail anything still pending.
    pub async fn disconnect(&self, cancel: &CancellationToken) -> Result<()> {
        if self.session.state().is_closed() {
            self.session.set_state(SessionState::Disconnected);
            return Ok(());
        }

        self.session.set_state(SessionState::Closing);
        self.shutdown.cancel();
        let pump = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        let result = self.session.transport().disconnect(cancel).await;
        self.session.on_transport_closed(TransportState::Disconnected);
        result
    }

    async fn reply(&self, message: Message) {
        if let Err(e) = self.session.send(&message, &CancellationToken::new()).await {
            warn!("Failed to send reply: {}", e);
        }
    }

    async fn handle_message(self: &Arc<Self>, message: Message) {
        match message {
            reply @ (Message::Response(_) | Message::Error(_)) => {
                self.session.route_response(reply);
            }
            Message::Request(req) if req.method == methods::PING => {
                self.reply(Message::response(req.id, json!({}))).await;
            }
            Message::Request(req) => {
                let Some(handler) = self.options.handler.clone() else {
                    let error = JsonRpcError::new(
                        error_codes::METHOD_NOT_FOUND,
                        format!("Method not found: {}", req.method),
                    );
                    self.reply(Message::error(Some(req.id), error)).await;
                    return;
                };

                let this = self.clone();
                let cancel = self.shutdown.child_token();
                tokio::spawn(async move {
                    let ctx = RequestContext {
                        session_id: String::new(),
                        request_id: req.id.clone(),
                        method: req.method.clone(),
                        cancel,
                    };
                    let reply = match handler.handle_request(ctx, req.params).await {
                        Ok(result) => Message::response(req.id, result),
                        Err(e) => Message::error(Some(req.id), e.to_rpc_error()),
                    };
                    this.reply(reply).await;
                });
            }
            Message::Notification(notif) => {
                if notif.method == methods::CANCELLED {
                    debug!("Server cancelled a request: {:?}", notif.params);
                    return;
                }
                if let Some(handler) = &self.options.handler {
                    handler
                        .handle_notification(&notif.method, notif.params.clone())
                        .await;
                }
                self.notifications.emit(notif);
            }
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn pump(
    client: Weak<ClientSession>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(event) = event else { return };
        let Some(this) = client.upgrade() else { return };

        match event {
            TransportEvent::MessageReceived(message) => this.handle_message(message).await,
            TransportEvent::StateChanged { new, .. } if new.is_closed() => {
                info!("Transport closed ({}), ending session", new);
                this.session.on_transport_closed(new);
                return;
            }
            TransportEvent::StateChanged { .. } => {}
            TransportEvent::Error(e) => debug!("Transport error: {}", e),
        }
    }
}
