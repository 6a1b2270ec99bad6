//! MCP protocol types and message definitions.
//!
//! Based on the Model Context Protocol specification. Every message on the
//! wire is one JSON-RPC 2.0 object; [`Message`] is the tagged union of the
//! four shapes and owns the rules for telling them apart.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Error, Result};
use crate::mcp::capabilities::{ClientCapabilities, ServerCapabilities};

/// JSON-RPC version.
pub const JSONRPC_VERSION: &str = "2.0";

/// Latest MCP protocol version.
pub const MCP_VERSION: &str = "2025-06-18";

/// Protocol versions this implementation can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[MCP_VERSION, "2025-03-26", "2024-11-05"];

/// Check whether a protocol version string is one we can negotiate.
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

// ===== JSON-RPC Base Types =====

/// Request ID (can be string or number).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Self::Number)
                .ok_or_else(|| Error::Protocol(format!("Request id is not an integer: {}", n))),
            Value::String(s) => Ok(Self::String(s.clone())),
            other => Err(Error::Protocol(format!(
                "Request id must be a string or integer, got {}",
                other
            ))),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self::Number(i64::from(n))
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// A JSON-RPC request.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// A successful JSON-RPC response. `result` may be an explicit null.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub result: Value,
}

/// A JSON-RPC error response. The id is absent (null) when the failing
/// request could not even be parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcErrorResponse {
    pub id: Option<RequestId>,
    pub error: JsonRpcError,
}

/// A JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// A JSON-RPC error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Create an error without structured data.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// A message that can be sent or received.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Error(JsonRpcErrorResponse),
    Notification(JsonRpcNotification),
}

impl Message {
    /// Build a request message.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(JsonRpcRequest::new(id, method, params))
    }

    /// Build a success response.
    pub fn response(id: RequestId, result: Value) -> Self {
        Self::Response(JsonRpcResponse { id, result })
    }

    /// Build an error response.
    pub fn error(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self::Error(JsonRpcErrorResponse { id, error })
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(JsonRpcNotification::new(method, params))
    }

    /// Parse one message from its JSON text.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| Error::Parse(format!("Malformed JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Discriminate a decoded JSON value into one of the four message shapes.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(Error::Parse(format!(
                    "Message must be a JSON object, got {}",
                    json_kind(&other)
                )))
            }
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(Error::Protocol(format!(
                    "Unsupported jsonrpc version: {}",
                    other
                )))
            }
            None => return Err(Error::Protocol("Missing jsonrpc version".to_string())),
        }

        let id = obj.remove("id");
        let params = obj.remove("params");

        if let Some(method) = obj.remove("method") {
            let method = match method {
                Value::String(m) => m,
                other => {
                    return Err(Error::Protocol(format!(
                        "Method must be a string, got {}",
                        json_kind(&other)
                    )))
                }
            };
            if obj.contains_key("result") || obj.contains_key("error") {
                return Err(Error::Protocol(format!(
                    "Message for method '{}' also carries a result or error",
                    method
                )));
            }
            return match id {
                Some(id) => Ok(Self::Request(JsonRpcRequest {
                    id: RequestId::from_value(&id)?,
                    method,
                    params,
                })),
                None => Ok(Self::Notification(JsonRpcNotification { method, params })),
            };
        }

        let result = obj.remove("result");
        let error = obj.remove("error");

        match (id, result, error) {
            (Some(_), Some(_), Some(_)) => Err(Error::Protocol(
                "Response carries both result and error".to_string(),
            )),
            (Some(Value::Null), Some(_), None) => Err(Error::Protocol(
                "Success response requires a non-null id".to_string(),
            )),
            (Some(id), Some(result), None) => Ok(Self::Response(JsonRpcResponse {
                id: RequestId::from_value(&id)?,
                result,
            })),
            (Some(id), None, Some(error)) => {
                let error: JsonRpcError = serde_json::from_value(error)
                    .map_err(|e| Error::Protocol(format!("Malformed error object: {}", e)))?;
                let id = match id {
                    Value::Null => None,
                    other => Some(RequestId::from_value(&other)?),
                };
                Ok(Self::Error(JsonRpcErrorResponse { id, error }))
            }
            _ => Err(Error::Protocol(
                "Message is neither a request, response, error nor notification".to_string(),
            )),
        }
    }

    /// Encode into a JSON object carrying the fixed version tag.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));

        match self {
            Self::Request(req) => {
                obj.insert("id".to_string(), req.id.to_value());
                obj.insert("method".to_string(), Value::String(req.method.clone()));
                if let Some(params) = &req.params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
            Self::Response(res) => {
                obj.insert("id".to_string(), res.id.to_value());
                obj.insert("result".to_string(), res.result.clone());
            }
            Self::Error(err) => {
                let id = err.id.as_ref().map(RequestId::to_value).unwrap_or(Value::Null);
                obj.insert("id".to_string(), id);
                // JsonRpcError holds only strings, numbers and JSON values.
                let error = serde_json::to_value(&err.error).unwrap_or(Value::Null);
                obj.insert("error".to_string(), error);
            }
            Self::Notification(notif) => {
                obj.insert("method".to_string(), Value::String(notif.method.clone()));
                if let Some(params) = &notif.params {
                    obj.insert("params".to_string(), params.clone());
                }
            }
        }

        Value::Object(obj)
    }

    /// Encode as single-line JSON text.
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    /// The id this message carries, if any.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(req) => Some(&req.id),
            Self::Response(res) => Some(&res.id),
            Self::Error(err) => err.id.as_ref(),
            Self::Notification(_) => None,
        }
    }

    /// The method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(notif) => Some(&notif.method),
            _ => None,
        }
    }

    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
            Self::Notification(_) => "notification",
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(req: JsonRpcRequest) -> Self {
        Self::Request(req)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(notif: JsonRpcNotification) -> Self {
        Self::Notification(notif)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ===== MCP Handshake Types =====

/// Identity of one end of the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website_url: Option<String>,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            title: None,
            website_url: None,
        }
    }
}

/// Initialize request params (client → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ClientCapabilities,
    pub client_info: Implementation,
}

/// Initialize result (server → client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Params of `notifications/cancelled`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Well-known method names used by the session layer.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const MESSAGE: &str = "notifications/message";
}

// ===== Error Codes =====

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const CONNECTION_CLOSED: i32 = -32000;
    pub const REQUEST_TIMEOUT: i32 = -32001;
}
