//! JSON-RPC 2.0 framing for the downstream MCP protocol.
//!
//! Every downstream transport (stdio, streamable HTTP, SSE) carries the same
//! request/response shapes; only the byte transport differs.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::TransportError;

/// MCP protocol revision the agent announces during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Process-wide monotonic request id counter, shared by all transports.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response, success or error.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Build a JSON-RPC notification (no id, no response expected).
pub fn notification(method: &str, params: Option<Value>) -> Value {
    let mut msg = serde_json::json!({ "jsonrpc": "2.0", "method": method });
    if let Some(p) = params {
        msg["params"] = p;
    }
    msg
}

/// Unwrap a response into its result, converting the error branch into a
/// [`TransportError::Rpc`].
pub fn extract_result(response: Response) -> Result<Value, TransportError> {
    if let Some(err) = response.error {
        return Err(TransportError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    response.result.ok_or_else(|| {
        TransportError::Protocol("response carries neither result nor error".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_monotonic() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }

    #[test]
    fn request_omits_absent_params() {
        let req = Request::new(7, "tools/list", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":7"));
        assert!(!json.contains("params"));
    }

    #[test]
    fn notification_has_no_id() {
        let msg = notification("notifications/initialized", None);
        assert!(msg.get("id").is_none());
        assert_eq!(msg["method"], "notifications/initialized");
    }

    #[test]
    fn extract_result_success() {
        let resp: Response =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}"#).unwrap();
        let result = extract_result(resp).unwrap();
        assert!(result["tools"].as_array().unwrap().is_empty());
    }

    #[test]
    fn extract_result_error_branch() {
        let resp: Response = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match extract_result(resp).unwrap_err() {
            TransportError::Rpc { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected Rpc error, got {other}"),
        }
    }

    #[test]
    fn extract_result_missing_both() {
        let resp: Response = serde_json::from_str(r#"{"jsonrpc":"2.0","id":3}"#).unwrap();
        assert!(matches!(
            extract_result(resp),
            Err(TransportError::Protocol(_))
        ));
    }
}
