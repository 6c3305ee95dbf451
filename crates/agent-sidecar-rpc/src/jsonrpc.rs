//! JSON-RPC 2.0 envelope types.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use thiserror::Error;

/// Protocol version literal.
pub const JSONRPC_VERSION: &str = "2.0";

// Standard codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

// Application codes.
pub const SERVER_ERROR: i64 = -32000;
pub const PERMISSION_DENIED: i64 = -32001;

/// A JSON-RPC 2.0 request. `id` is absent for notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Request {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Either a result or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Result(Value),
    Error(ErrorObject),
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Response {
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            outcome: Outcome::Result(result),
        }
    }

    #[must_use]
    pub fn error(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            id,
            outcome: Outcome::Error(ErrorObject {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Serialize for the wire.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        // A response holds only JSON values and strings, so this cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Error a handler returns to the dispatcher.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Arguments did not fit the method signature.
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    /// Application error surfaced to the caller verbatim.
    #[error("{message}")]
    Custom {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    /// Unexpected failure. The detail is logged, not sent.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RpcError {
    #[must_use]
    pub fn custom(code: i64, message: impl Into<String>) -> Self {
        Self::Custom {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::Custom { code, .. } => *code,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }
}

/// Request parameters as they arrived.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    None,
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Params {
    /// Classify a raw `params` member.
    ///
    /// # Errors
    /// Returns [`RpcError::InvalidParams`] for scalars.
    pub fn from_value(value: Option<Value>) -> Result<Self, RpcError> {
        match value {
            None | Some(Value::Null) => Ok(Self::None),
            Some(Value::Array(items)) => Ok(Self::Positional(items)),
            Some(Value::Object(map)) => Ok(Self::Named(map)),
            Some(other) => Err(RpcError::InvalidParams(format!(
                "params must be an array or object, got {other}"
            ))),
        }
    }

    /// Bind to a typed argument struct whose fields are `names`, in order.
    ///
    /// Positional arguments fill `names` left to right; named arguments must
    /// all appear in `names`. Missing optional fields take their serde
    /// defaults.
    ///
    /// # Errors
    /// Returns [`RpcError::InvalidParams`] on arity or name mismatch, or if
    /// the values do not deserialize.
    pub fn bind<T: DeserializeOwned>(self, names: &[&str]) -> Result<T, RpcError> {
        let map = match self {
            Self::None => Map::new(),
            Self::Positional(items) => {
                if items.len() > names.len() {
                    return Err(RpcError::InvalidParams(format!(
                        "takes {} positional arguments but {} were given",
                        names.len(),
                        items.len()
                    )));
                }
                names
                    .iter()
                    .map(|n| (*n).to_owned())
                    .zip(items)
                    .collect()
            }
            Self::Named(map) => {
                if let Some(unknown) = map.keys().find(|k| !names.contains(&k.as_str())) {
                    return Err(RpcError::InvalidParams(format!(
                        "unexpected keyword argument '{unknown}'"
                    )));
                }
                map
            }
        };
        serde_json::from_value(Value::Object(map))
            .map_err(|e| RpcError::InvalidParams(e.to_string()))
    }
}

/// Argument struct for methods that take nothing.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct NoParams {}
