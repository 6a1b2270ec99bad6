//! Model Context Protocol (MCP) transport and session layer.
//!
//! # Architecture
//!
//! - `protocol` - JSON-RPC 2.0 message model and MCP handshake types
//! - `capabilities` - capability declarations exchanged during `initialize`
//! - `transport` - the transport contract plus stdio, HTTP/SSE and WebSocket transports
//! - `session` - pending-request bookkeeping shared by both roles
//! - `client` / `server` - the two ends of a negotiated session
//! - `handler` - the boundary between a session and application methods
//! - `unix_server` - multi-client Unix socket listener

pub mod capabilities;
pub mod client;
pub mod events;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;
pub mod unix_server;

pub use capabilities::{ClientCapabilities, ServerCapabilities};
pub use client::{ClientOptions, ClientSession};
pub use handler::{EchoMethod, MethodHandler, MethodRouter, RequestContext, RequestHandler};
pub use protocol::*;
pub use server::{ServerEvent, ServerOptions, ServerSession};
pub use session::{Session, SessionEvent, SessionState};
pub use transport::{
    HttpTransport, StdioTransport, Transport, TransportEvent, TransportState, WebSocketTransport,
};
pub use unix_server::UnixSocketServer;
