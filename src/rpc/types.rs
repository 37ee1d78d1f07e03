//! JSON-RPC protocol types

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::StoreError;

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Store errors the caller can act on
pub const STORE_ERROR: i32 = -32000;

/// JSON-RPC request
#[derive(Debug, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: serde_json::Value,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<serde_json::Value>, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC response
#[derive(Debug, Deserialize, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn error(id: serde_json::Value, code: i32, message: &str) -> Self {
        Self::failure(id, JsonRpcError::new(code, message))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn invalid_params(e: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("Invalid params: {}", e))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }
}

impl From<StoreError> for JsonRpcError {
    fn from(err: StoreError) -> Self {
        let code = match err {
            StoreError::Database(_)
            | StoreError::Pool(_)
            | StoreError::Serde(_)
            | StoreError::Io(_)
            | StoreError::Task(_) => INTERNAL_ERROR,
            _ => STORE_ERROR,
        };
        Self {
            code,
            message: err.to_string(),
            data: Some(json!({
                "code": err.code(),
                "retryable": err.is_retryable(),
            })),
        }
    }
}

impl From<serde_json::Error> for JsonRpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(INTERNAL_ERROR, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_carries_code_and_retryable() {
        let err: JsonRpcError = StoreError::TransactionConflict("database is locked".into()).into();
        assert_eq!(err.code, STORE_ERROR);
        let data = err.data.unwrap();
        assert_eq!(data["code"], "TRANSACTION_CONFLICT");
        assert_eq!(data["retryable"], true);

        let err: JsonRpcError = StoreError::InvalidScore {
            field: "score",
            value: 1.5,
        }
        .into();
        let data = err.data.unwrap();
        assert_eq!(data["code"], "INVALID_SCORE");
        assert_eq!(data["retryable"], false);
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let ok = serde_json::to_value(JsonRpcResponse::success(json!(1), json!("ok"))).unwrap();
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(JsonRpcResponse::error(json!(2), METHOD_NOT_FOUND, "nope")).unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"]["code"], METHOD_NOT_FOUND);
    }
}
