//! MCP Wire - transport and session substrate for the Model Context Protocol.
//!
//! # Architecture
//!
//! 1. **Message model** (`mcp::protocol`) - JSON-RPC 2.0 messages and handshake payloads
//! 2. **Transports** (`mcp::transport`) - stdio, HTTP/SSE client and WebSocket
//! 3. **Sessions** (`mcp::session`, `mcp::client`, `mcp::server`) - pending-request
//!    tracking, the `initialize` handshake and capability negotiation
//! 4. **Servers** (`mcp::unix_server`, `http`) - multi-client listeners that give
//!    every connection its own session
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcp_wire_rs::mcp::{ClientOptions, ClientSession, Implementation, StdioTransport};
//! use mcp_wire_rs::mcp::transport::CommandSpec;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> mcp_wire_rs::Result<()> {
//! let transport = Arc::new(StdioTransport::spawn(CommandSpec::new("mcp-wire")));
//! let client = ClientSession::new(transport, ClientOptions::new(Implementation::new("demo", "1.0")));
//! let cancel = CancellationToken::new();
//! client.connect(&cancel).await?;
//! let echoed = client.request("echo", Some(serde_json::json!({"hi": 1})), &cancel).await?;
//! # let _ = echoed;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod metrics;

pub use error::{Error, Result};

/// Crate version reported by the demo server.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
