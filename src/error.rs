//! Error types for the MCP transport and session layer.

use serde_json::Value;
use thiserror::Error;

use crate::mcp::protocol::{error_codes, JsonRpcError};

/// Result type alias for transport and session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the MCP wire layer.
#[derive(Error, Debug)]
pub enum Error {
    // ===== Message Errors =====
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // ===== Remote Errors =====
    #[error("Remote error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    // ===== Transport Errors =====
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected: transport is {0}")]
    NotConnected(String),

    #[error("HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Server already running on {0}")]
    AlreadyRunning(String),

    // ===== I/O Errors =====
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    // ===== Internal Errors =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout: operation timed out after {millis} ms")]
    Timeout { millis: u64 },

    #[error("Cancelled: operation was cancelled")]
    Cancelled,
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(e))
    }
}

impl From<JsonRpcError> for Error {
    fn from(e: JsonRpcError) -> Self {
        Self::Rpc {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

impl Error {
    /// Create a remote error from its wire fields.
    pub fn rpc(code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data,
        }
    }

    /// Convert into the JSON-RPC error object sent back to a peer.
    ///
    /// Remote errors keep their code, message and data; everything else maps
    /// onto the closest standard code with the display text as the message.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let code = match self {
            Self::Rpc {
                code,
                message,
                data,
            } => {
                return JsonRpcError {
                    code: *code,
                    message: message.clone(),
                    data: data.clone(),
                }
            }
            Self::Parse(_) | Self::Json(_) => error_codes::PARSE_ERROR,
            Self::Protocol(_) => error_codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Self::ConnectionClosed(_) => error_codes::CONNECTION_CLOSED,
            Self::Timeout { .. } => error_codes::REQUEST_TIMEOUT,
            _ => error_codes::INTERNAL_ERROR,
        };

        JsonRpcError {
            code,
            message: self.to_string(),
            data: None,
        }
    }

    /// Whether the error means the peer connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_) | Self::NotConnected(_))
    }

    /// Check if this error is retriable (transient failures).
    ///
    /// Decides whether a lost SSE stream is worth reopening.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Http(e) => !e.is_builder(),
            Self::ConnectionClosed(_) | Self::Io(_) | Self::Timeout { .. } => true,
            _ => false,
        }
    }
}
