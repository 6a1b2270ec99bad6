//! Request dispatch boundary between a session and application code.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::mcp::protocol::RequestId;

/// Per-request data handed to a handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Id of the session the request arrived on.
    pub session_id: String,
    pub request_id: RequestId,
    pub method: String,
    /// Tripped when the peer sends `notifications/cancelled` or the session closes.
    pub cancel: CancellationToken,
}

/// Application-side handler for inbound requests and notifications.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Answer one request. Errors become JSON-RPC error responses.
    async fn handle_request(&self, ctx: RequestContext, params: Option<Value>) -> Result<Value>;

    /// React to a notification. Ignored by default.
    async fn handle_notification(&self, method: &str, _params: Option<Value>) {
        debug!("Unhandled notification: {}", method);
    }
}

/// Handler for a single method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Method name this handler answers.
    fn method(&self) -> &str;

    /// Execute the method.
    async fn call(&self, ctx: RequestContext, params: Option<Value>) -> Result<Value>;
}

type MethodFn = Arc<dyn Fn(RequestContext, Option<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Registry of method handlers.
pub struct MethodRouter {
    methods: HashMap<String, MethodFn>,
}

impl MethodRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Register a method handler.
    pub fn register<H: MethodHandler + 'static>(&mut self, handler: H) {
        let handler = Arc::new(handler);
        let name = handler.method().to_string();
        let method: MethodFn = Arc::new(
            move |ctx: RequestContext, params: Option<Value>| -> BoxFuture<'static, Result<Value>> {
                let handler = handler.clone();
                Box::pin(async move { handler.call(ctx, params).await })
            },
        );
        self.methods.insert(name, method);
    }

    /// Register a closure for `method`.
    pub fn register_fn<F, Fut>(&mut self, method: impl Into<String>, f: F)
    where
        F: Fn(RequestContext, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let handler: MethodFn = Arc::new(
            move |ctx: RequestContext, params: Option<Value>| -> BoxFuture<'static, Result<Value>> {
                Box::pin(f(ctx, params))
            },
        );
        self.methods.insert(method.into(), handler);
    }

    /// Check if a method exists.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Get the number of registered methods.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MethodRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestHandler for MethodRouter {
    async fn handle_request(&self, ctx: RequestContext, params: Option<Value>) -> Result<Value> {
        let method = self
            .methods
            .get(&ctx.method)
            .cloned()
            .ok_or_else(|| Error::MethodNotFound(ctx.method.clone()))?;
        method(ctx, params).await
    }
}

/// Answers `echo` with its params unchanged.
pub struct EchoMethod;

#[async_trait]
impl MethodHandler for EchoMethod {
    fn method(&self) -> &str {
        "echo"
    }

    async fn call(&self, _ctx: RequestContext, params: Option<Value>) -> Result<Value> {
        Ok(params.unwrap_or(Value::Null))
    }
}

/// Deserialize request params, reporting failures as invalid params.
pub fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.ok_or_else(|| Error::InvalidParams("Missing params".to_string()))?;
    serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}
