//! HTTP server for MCP over the HTTP/SSE transport.
//!
//! `GET <sse_path>` opens a session and streams its outbound messages as
//! numbered SSE events; `POST <post_path>` delivers one inbound message to the
//! session named by `Mcp-Session-Id`; `DELETE <post_path>` closes it.

pub mod transport;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, MethodRouter},
    Json, Router,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::{Config, HttpServerConfig};
use crate::error::Result;
use crate::mcp::protocol::Message;
use crate::mcp::server::{until_closed, ServerEvent, ServerOptions, ServerSession, SessionRegistry};
use crate::mcp::transport::Transport;

pub use transport::{HttpSessionTransport, OutboundEvent};

const SESSION_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");
const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

/// HTTP server state.
pub struct HttpState {
    config: HttpServerConfig,
    options: ServerOptions,
    registry: SessionRegistry,
    transports: Mutex<HashMap<String, Arc<HttpSessionTransport>>>,
    shutdown: CancellationToken,
}

impl HttpState {
    fn lock_transports(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<HttpSessionTransport>>> {
        self.transports.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transport(&self, id: &str) -> Option<Arc<HttpSessionTransport>> {
        self.lock_transports().get(id).cloned()
    }

    fn authorize(&self, headers: &HeaderMap) -> std::result::Result<(), Response> {
        let Some(expected) = &self.config.bearer_token else {
            return Ok(());
        };
        let provided = header_str(headers, &header::AUTHORIZATION)
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided == Some(expected.as_str()) {
            Ok(())
        } else {
            Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized"))
        }
    }

    /// Create a session with a fresh transport and an attached stream.
    async fn open_session(
        self: &Arc<Self>,
    ) -> Result<(String, mpsc::UnboundedReceiver<OutboundEvent>)> {
        let transport = Arc::new(HttpSessionTransport::new(self.config.replay_buffer));
        let stream = transport.attach(None);
        let session = ServerSession::new(transport.clone(), self.options.clone());
        let mut events = session.subscribe();
        session.start(&self.shutdown).await?;

        let id = session.id().to_string();
        self.lock_transports().insert(id.clone(), transport);
        self.registry.insert(session);
        info!(session = %id, "HTTP session opened");

        let state = self.clone();
        let watched = id.clone();
        tokio::spawn(async move {
            until_closed(&mut events).await;
            state.forget(&watched);
        });
        Ok((id, stream))
    }

    fn forget(&self, id: &str) {
        self.lock_transports().remove(id);
        if self.registry.remove(id).is_some() {
            debug!(session = %id, "HTTP session closed");
        }
    }

    async fn close_all(&self) {
        self.registry.close_all().await;
        self.lock_transports().clear();
    }
}

/// MCP endpoint serving any number of HTTP/SSE clients.
pub struct HttpServer {
    state: Arc<HttpState>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, options: ServerOptions) -> Self {
        Self {
            state: Arc::new(HttpState {
                config,
                options,
                registry: SessionRegistry::new(),
                transports: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.state.registry.len()
    }

    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.state.registry.snapshot()
    }

    /// Subscribe to session created/closed events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.state.registry.subscribe()
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let config = &self.state.config;
        let stream: MethodRouter<Arc<HttpState>> = get(open_stream);
        let messages: MethodRouter<Arc<HttpState>> =
            axum::routing::post(post_message).delete(delete_session);

        let router = if config.sse_path == config.post_path {
            Router::new().route(&config.sse_path, stream.merge(messages))
        } else {
            Router::new()
                .route(&config.sse_path, stream)
                .route(&config.post_path, messages)
        };

        router
            .route("/health", get(health_check))
            .route("/metrics", get(metrics))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
                    .expose_headers([SESSION_HEADER]),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on `listener` until `shutdown` fires, then close every session.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let state = self.state.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                // Ends every open SSE stream so connections can drain.
                state.shutdown.cancel();
                state.close_all().await;
            })
            .await?;
        Ok(())
    }

    /// Close every session.
    pub async fn close_all(&self) {
        self.state.close_all().await;
    }
}

/// Start the HTTP server.
pub async fn start_server(config: &Config, options: ServerOptions) -> Result<()> {
    let server = HttpServer::new(config.http_server(), options);
    let addr = config.bind_addr();
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });
    server.serve(listener, shutdown).await
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn event_stream(session_id: &str, events: mpsc::UnboundedReceiver<OutboundEvent>) -> Response {
    let Ok(value) = HeaderValue::from_str(session_id) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid session id");
    };
    let stream = UnboundedReceiverStream::new(events).map(|event| {
        Ok::<_, Infallible>(Event::default().id(event.id.to_string()).data(event.data))
    });
    (
        [(SESSION_HEADER, value)],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// SSE stream endpoint.
async fn open_stream(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = state.authorize(&headers) {
        return rejection;
    }

    let last_event_id =
        header_str(&headers, &LAST_EVENT_ID).and_then(|v| v.trim().parse::<u64>().ok());
    if let Some(id) = header_str(&headers, &SESSION_HEADER) {
        if let Some(transport) = state.transport(id) {
            if !transport.state().is_closed() {
                debug!(session = %id, ?last_event_id, "Re-attaching SSE stream");
                let events = transport.attach(last_event_id);
                return event_stream(id, events);
            }
        }
        debug!(session = %id, "Unknown session on GET, opening a new one");
    }

    match state.open_session().await {
        Ok((id, events)) => event_stream(&id, events),
        Err(e) => {
            warn!("Failed to open HTTP session: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Inbound message endpoint.
async fn post_message(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(rejection) = state.authorize(&headers) {
        return rejection;
    }
    let Some(id) = header_str(&headers, &SESSION_HEADER) else {
        return error_response(StatusCode::BAD_REQUEST, "missing Mcp-Session-Id");
    };
    let Some(transport) = state.transport(id) else {
        return error_response(StatusCode::NOT_FOUND, "unknown Mcp-Session-Id");
    };

    let message = match Message::parse(&body) {
        Ok(message) => message,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    match transport.deliver(message) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(_) => error_response(StatusCode::NOT_FOUND, "session closed"),
    }
}

/// Session teardown endpoint.
async fn delete_session(State(state): State<Arc<HttpState>>, headers: HeaderMap) -> Response {
    if let Err(rejection) = state.authorize(&headers) {
        return rejection;
    }
    let Some(id) = header_str(&headers, &SESSION_HEADER) else {
        return error_response(StatusCode::BAD_REQUEST, "missing Mcp-Session-Id");
    };
    let Some(session) = state.registry.get(id) else {
        return error_response(StatusCode::NOT_FOUND, "unknown Mcp-Session-Id");
    };

    if let Err(e) = session.close(&CancellationToken::new()).await {
        debug!(session = %id, "Error closing session: {}", e);
    }
    state.forget(id);
    StatusCode::NO_CONTENT.into_response()
}

/// Health check endpoint.
async fn health_check(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "sessions": state.registry.len(),
    }))
}

/// Prometheus metrics endpoint.
async fn metrics(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.options.metrics.to_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handler::MethodRouter;
    use crate::mcp::protocol::Implementation;

    async fn spawn_server(config: HttpServerConfig) -> (String, CancellationToken, Arc<HttpServer>) {
        let options = ServerOptions::new(
            Implementation::new("http-test", "0.1.0"),
            Arc::new(MethodRouter::new()),
        );
        let server = Arc::new(HttpServer::new(config, options));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let running = server.clone();
        let signal = shutdown.clone();
        tokio::spawn(async move { running.serve(listener, signal).await });
        (base, shutdown, server)
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let (base, shutdown, _server) = spawn_server(HttpServerConfig::default()).await;
        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["sessions"], 0);

        let text = client
            .get(format!("{}/metrics", base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("mcp_wire_sessions_total 0"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_post_rejections() {
        let (base, shutdown, _server) = spawn_server(HttpServerConfig::default()).await;
        let client = reqwest::Client::new();
        let body = r#"{"jsonrpc":"2.0","method":"ping","id":1}"#;

        let missing = client
            .post(format!("{}/", base))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);

        let unknown = client
            .post(format!("{}/", base))
            .header("Mcp-Session-Id", "nope")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

        let delete = client
            .delete(format!("{}/", base))
            .header("Mcp-Session-Id", "nope")
            .send()
            .await
            .unwrap();
        assert_eq!(delete.status(), reqwest::StatusCode::NOT_FOUND);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_bearer_token_gate() {
        let config = HttpServerConfig {
            bearer_token: Some("secret".to_string()),
            ..HttpServerConfig::default()
        };
        let (base, shutdown, server) = spawn_server(config).await;
        let client = reqwest::Client::new();

        let rejected = client
            .get(format!("{}/sse", base))
            .send()
            .await
            .unwrap();
        assert_eq!(rejected.status(), reqwest::StatusCode::UNAUTHORIZED);
        assert_eq!(server.session_count(), 0);

        let accepted = client
            .get(format!("{}/sse", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::OK);
        assert!(accepted.headers().contains_key("mcp-session-id"));
        assert_eq!(server.session_count(), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_body_and_delete() {
        let (base, shutdown, server) = spawn_server(HttpServerConfig::default()).await;
        let mut events = server.subscribe();
        let client = reqwest::Client::new();

        let stream = client.get(format!("{}/sse", base)).send().await.unwrap();
        let id = stream.headers()["mcp-session-id"].to_str().unwrap().to_string();
        assert!(matches!(events.recv().await, Some(ServerEvent::SessionCreated(_))));

        let bad = client
            .post(format!("{}/", base))
            .header("Mcp-Session-Id", &id)
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);

        let ok = client
            .post(format!("{}/", base))
            .header("Mcp-Session-Id", &id)
            .body(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), reqwest::StatusCode::ACCEPTED);

        let deleted = client
            .delete(format!("{}/", base))
            .header("Mcp-Session-Id", &id)
            .send()
            .await
            .unwrap();
        assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);
        match events.recv().await {
            Some(ServerEvent::SessionClosed(session)) => assert_eq!(session.id(), id),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(server.session_count(), 0);
        shutdown.cancel();
    }
}
