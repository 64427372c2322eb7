//! JSON-RPC 2.0 envelope forwarded to the downstream publishing service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
            id: Value::from(0),
        }
    }

    /// Set a param, replacing a non-object `params` with an empty object first.
    pub fn set_param(&mut self, key: impl Into<String>, value: Value) {
        if !self.params.is_object() {
            self.params = Value::Object(Map::new());
        }
        if let Some(map) = self.params.as_object_mut() {
            map.insert(key.into(), value);
        }
    }

    pub fn remove_param(&mut self, key: &str) -> Option<Value> {
        self.params.as_object_mut().and_then(|m| m.remove(key))
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_object().and_then(|m| m.get(key))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    #[serde(default)]
    pub id: Value,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
