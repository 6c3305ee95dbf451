//! Method routing for JSON-RPC requests.

use std::{collections::HashMap, future::Future, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::jsonrpc::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION, METHOD_NOT_FOUND,
    PARSE_ERROR, Params, Response, RpcError,
};

/// An async method implementation.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, params: Params) -> Result<Value, RpcError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RpcError>> + Send,
{
    async fn call(&self, params: Params) -> Result<Value, RpcError> {
        (self.0)(params).await
    }
}

/// Validates envelopes and routes them to registered handlers.
#[derive(Default)]
pub struct Dispatcher {
    methods: HashMap<String, Arc<dyn Handler>>,
    expose_internal_errors: bool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("methods", &names)
            .field("expose_internal_errors", &self.expose_internal_errors)
            .finish()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Include internal error detail in responses. Off by default.
    #[must_use]
    pub const fn expose_internal_errors(mut self, expose: bool) -> Self {
        self.expose_internal_errors = expose;
        self
    }

    /// Register a handler. A later registration under the same name wins.
    pub fn register(&mut self, name: impl Into<String>, handler: impl Handler + 'static) {
        let name = name.into();
        if self.methods.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::debug!(method = %name, "replaced method handler");
        } else {
            tracing::debug!(method = %name, "registered method");
        }
    }

    /// Register a closure taking raw [`Params`].
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.register(name, FnHandler(f));
    }

    /// Register a closure taking a typed argument struct.
    ///
    /// `arg_names` lists the struct's fields in positional order.
    pub fn register_typed<P, R, F, Fut>(
        &mut self,
        name: impl Into<String>,
        arg_names: &'static [&'static str],
        f: F,
    ) where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_fn(name, move |params: Params| {
            call_typed(Arc::clone(&f), params, arg_names)
        });
    }

    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Handle one raw message and return the raw reply.
    ///
    /// An empty reply means nothing should be sent back.
    pub async fn handle(&self, raw: &[u8]) -> Vec<u8> {
        let parsed = std::str::from_utf8(raw)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<Value>(text).map_err(|e| e.to_string()));

        let request = match parsed {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                return Response::error(Value::Null, PARSE_ERROR, format!("Parse error: {e}"), None)
                    .to_bytes();
            }
        };

        match request {
            Value::Array(items) => self.handle_batch(items).await,
            single => self
                .handle_single(single)
                .await
                .map(|r| r.to_bytes())
                .unwrap_or_default(),
        }
    }

    async fn handle_batch(&self, items: Vec<Value>) -> Vec<u8> {
        let mut responses = Vec::with_capacity(items.len());
        for item in items {
            if let Some(response) = self.handle_single(item).await {
                responses.push(response);
            }
        }
        if responses.is_empty() {
            return Vec::new();
        }
        serde_json::to_vec(&responses).unwrap_or_default()
    }

    /// `None` for a successful notification.
    async fn handle_single(&self, request: Value) -> Option<Response> {
        let Value::Object(mut obj) = request else {
            return Some(Response::error(Value::Null, INVALID_REQUEST, "Request must be object", None));
        };

        let id = obj.remove("id").filter(|v| !v.is_null());
        let reply_id = id.clone().unwrap_or(Value::Null);

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Some(Response::error(
                reply_id,
                INVALID_REQUEST,
                "Invalid or missing jsonrpc version",
                None,
            ));
        }
        let Some(Value::String(method)) = obj.remove("method") else {
            return Some(Response::error(reply_id, INVALID_REQUEST, "Method must be string", None));
        };
        let Some(handler) = self.methods.get(&method).cloned() else {
            return Some(Response::error(
                reply_id,
                METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
                None,
            ));
        };

        let outcome = match Params::from_value(obj.remove("params")) {
            Ok(params) => AssertUnwindSafe(handler.call(params))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(RpcError::Internal("handler panicked".to_owned()))),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => id.map(|id| Response::success(id, result)),
            Err(e) => Some(self.error_response(reply_id, &method, e)),
        }
    }

    fn error_response(&self, id: Value, method: &str, error: RpcError) -> Response {
        match error {
            RpcError::InvalidParams(detail) => {
                tracing::warn!(%method, %detail, "invalid params");
                Response::error(id, INVALID_PARAMS, format!("Invalid params: {detail}"), None)
            }
            RpcError::Custom { code, message, data } => {
                tracing::debug!(%method, code, %message, "method returned error");
                Response::error(id, code, message, data)
            }
            RpcError::Internal(detail) => {
                tracing::error!(%method, %detail, "internal error in method");
                let message = if self.expose_internal_errors {
                    format!("Internal error: {detail}")
                } else {
                    "Internal error".to_owned()
                };
                Response::error(id, INTERNAL_ERROR, message, None)
            }
        }
    }
}

async fn call_typed<P, R, F, Fut>(
    f: Arc<F>,
    params: Params,
    arg_names: &'static [&'static str],
) -> Result<Value, RpcError>
where
    P: DeserializeOwned,
    R: Serialize,
    F: Fn(P) -> Fut,
    Fut: Future<Output = Result<R, RpcError>>,
{
    let args = params.bind::<P>(arg_names)?;
    let result = f(args).await?;
    serde_json::to_value(result).map_err(|e| RpcError::Internal(e.to_string()))
}
