//! Configuration for transports, servers and the demo binary.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default SSE reconnect delay in milliseconds.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;

/// Default WebSocket keepalive ping interval in milliseconds.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 30_000;

/// Command-line arguments for the demo server.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-wire")]
#[command(author = "MCP Wire Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MCP server over stdio, Unix socket, WebSocket or HTTP/SSE transports")]
pub struct Args {
    /// Transport mode: stdio, unix, websocket or http
    #[arg(short, long, default_value = "stdio", env = "MCP_WIRE_TRANSPORT")]
    pub transport: TransportKind,

    /// Unix socket path (only for unix transport)
    #[arg(long, default_value = "/tmp/mcp-wire.sock", env = "MCP_WIRE_SOCKET")]
    pub socket_path: PathBuf,

    /// Bind address (websocket and http transports)
    #[arg(long, default_value = "127.0.0.1", env = "MCP_WIRE_HOST")]
    pub host: String,

    /// Listen port (websocket and http transports)
    #[arg(short, long, default_value = "3000", env = "MCP_WIRE_PORT")]
    pub port: u16,

    /// Bearer token required from clients
    #[arg(long, env = "MCP_WIRE_TOKEN")]
    pub token: Option<String>,

    /// Allowed Origin header values for WebSocket clients (repeatable)
    #[arg(long = "allowed-origin")]
    pub allowed_origins: Vec<String>,

    /// WebSocket keepalive ping interval in seconds (0 disables)
    #[arg(long, default_value = "30", env = "MCP_WIRE_PING_INTERVAL")]
    pub ping_interval_secs: u64,

    /// Server name reported during the handshake
    #[arg(long, default_value = "mcp-wire", env = "MCP_WIRE_NAME")]
    pub name: String,

    /// Enable debug logging
    #[arg(short, long, env = "MCP_WIRE_DEBUG")]
    pub debug: bool,
}

/// Transport mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Unix,
    Websocket,
    Http,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Transport mode
    pub transport: TransportKind,
    /// Unix socket path
    pub socket_path: PathBuf,
    /// Bind address
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Bearer token
    pub token: Option<String>,
    /// Allowed WebSocket origins
    pub allowed_origins: Vec<String>,
    /// Keepalive interval
    pub ping_interval_ms: u64,
    /// Server name
    pub name: String,
    /// Debug mode
    pub debug: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            transport: args.transport,
            socket_path: args.socket_path,
            host: args.host,
            port: args.port,
            token: args.token,
            allowed_origins: args.allowed_origins,
            ping_interval_ms: args.ping_interval_secs * 1000,
            name: args.name,
            debug: args.debug,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport: TransportKind::Stdio,
            socket_path: PathBuf::from("/tmp/mcp-wire.sock"),
            host: "127.0.0.1".to_string(),
            port: 3000,
            token: None,
            allowed_origins: Vec::new(),
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
            name: "mcp-wire".to_string(),
            debug: false,
        }
    }
}

impl Config {
    /// `host:port` to bind network listeners to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn unix_server(&self) -> UnixServerConfig {
        UnixServerConfig {
            path: self.socket_path.clone(),
            ..UnixServerConfig::default()
        }
    }

    pub fn http_server(&self) -> HttpServerConfig {
        HttpServerConfig {
            bearer_token: self.token.clone(),
            ..HttpServerConfig::default()
        }
    }
}

/// Options for the client side of the HTTP/SSE transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// Base URL, e.g. `http://localhost:3000`
    pub base_url: String,
    /// Path that outbound messages are POSTed to
    pub post_path: String,
    /// Path of the SSE GET stream
    pub sse_path: String,
    /// Bearer token sent on every request
    pub bearer_token: Option<String>,
    /// Reconnect the SSE stream after it fails or ends
    pub reconnect: bool,
    /// Delay before reconnecting, until the server sends `retry:`
    pub reconnect_delay_ms: u64,
    /// Give up after this many consecutive failed attempts (None = never)
    pub max_reconnect_attempts: Option<u32>,
    /// Timeout applied to each POST (None = leave it to the caller)
    pub request_timeout_ms: Option<u64>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_string(),
            post_path: "/".to_string(),
            sse_path: "/sse".to_string(),
            bearer_token: None,
            reconnect: true,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_reconnect_attempts: None,
            request_timeout_ms: None,
        }
    }
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Options for the client side of the WebSocket transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Base URL, e.g. `ws://localhost:3000`
    pub url: String,
    /// Path appended to the URL
    pub path: String,
    /// Subprotocols offered during the handshake
    pub subprotocols: Vec<String>,
    /// Bearer token sent with the handshake
    pub bearer_token: Option<String>,
    /// Origin header sent with the handshake
    pub origin: Option<String>,
    /// Keepalive ping interval (0 disables)
    pub ping_interval_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3000".to_string(),
            path: "/".to_string(),
            subprotocols: Vec::new(),
            bearer_token: None,
            origin: None,
            ping_interval_ms: DEFAULT_PING_INTERVAL_MS,
        }
    }
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Full endpoint URL.
    pub fn endpoint(&self) -> String {
        join_url(&self.url, &self.path)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_ms > 0).then(|| Duration::from_millis(self.ping_interval_ms))
    }
}

/// Options for the Unix socket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnixServerConfig {
    /// Filesystem path of the socket
    pub path: PathBuf,
    /// Mode applied to the socket file after binding
    pub permissions: Option<u32>,
}

impl Default for UnixServerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/mcp-wire.sock"),
            permissions: Some(0o600),
        }
    }
}

impl UnixServerConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

/// Options for the HTTP/SSE server endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Path of the SSE GET stream
    pub sse_path: String,
    /// Path that clients POST messages to
    pub post_path: String,
    /// Bearer token required from clients
    pub bearer_token: Option<String>,
    /// Outbound events kept per session for `Last-Event-ID` replay
    pub replay_buffer: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            sse_path: "/sse".to_string(),
            post_path: "/".to_string(),
            bearer_token: None,
            replay_buffer: 256,
        }
    }
}

/// Join a base URL and a path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        format!("{}/", base)
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_default() {
        assert_eq!(TransportKind::default(), TransportKind::Stdio);
    }

    #[test]
    fn test_transport_serialization() {
        let transports = [
            (TransportKind::Stdio, "\"stdio\""),
            (TransportKind::Unix, "\"unix\""),
            (TransportKind::Websocket, "\"websocket\""),
            (TransportKind::Http, "\"http\""),
        ];

        for (transport, expected) in &transports {
            let json = serde_json::to_string(transport).unwrap();
            assert_eq!(json, *expected);
        }
    }

    #[test]
    fn test_config_default_values() {
        let config = Config::default();

        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.port, 3000);
        assert!(!config.debug);
        assert!(config.token.is_none());
        assert_eq!(config.ping_interval_ms, 30_000);
        assert_eq!(config.bind_addr(), "127.0.0.1:3000");
    }

    #[test]
    fn test_http_transport_defaults() {
        let config = HttpTransportConfig::default();
        assert_eq!(config.post_path, "/");
        assert_eq!(config.sse_path, "/sse");
        assert!(config.reconnect);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(3000));
        assert!(config.max_reconnect_attempts.is_none());
        assert!(config.request_timeout().is_none());

        let bounded = HttpTransportConfig {
            request_timeout_ms: Some(250),
            ..HttpTransportConfig::default()
        };
        assert_eq!(bounded.request_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_http_transport_partial_deserialization() {
        let config: HttpTransportConfig = serde_json::from_str(
            r#"{"base_url": "http://example.com", "reconnect": false}"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "http://example.com");
        assert!(!config.reconnect);
        assert_eq!(config.sse_path, "/sse");
    }

    #[test]
    fn test_websocket_defaults() {
        let config = WebSocketConfig::new("ws://localhost:9000");
        assert_eq!(config.endpoint(), "ws://localhost:9000/");
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(30)));

        let disabled = WebSocketConfig {
            ping_interval_ms: 0,
            ..WebSocketConfig::default()
        };
        assert_eq!(disabled.ping_interval(), None);
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a:1", "/sse"), "http://a:1/sse");
        assert_eq!(join_url("http://a:1/", "sse"), "http://a:1/sse");
        assert_eq!(join_url("http://a:1/", "/"), "http://a:1/");
        assert_eq!(join_url("http://a:1/mcp", "/messages"), "http://a:1/mcp/messages");
    }

    #[test]
    fn test_args_to_config() {
        let args = Args {
            transport: TransportKind::Unix,
            socket_path: PathBuf::from("/run/mcp.sock"),
            host: "0.0.0.0".to_string(),
            port: 4000,
            token: Some("secret".to_string()),
            allowed_origins: vec!["https://app.example.com".to_string()],
            ping_interval_secs: 10,
            name: "demo".to_string(),
            debug: true,
        };

        let config: Config = args.into();

        assert_eq!(config.transport, TransportKind::Unix);
        assert_eq!(config.ping_interval_ms, 10_000);
        assert_eq!(config.unix_server().path, PathBuf::from("/run/mcp.sock"));
        assert_eq!(config.http_server().bearer_token.as_deref(), Some("secret"));
        assert!(config.debug);
    }
}
