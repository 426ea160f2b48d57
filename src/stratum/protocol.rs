//! Stratum wire types: line-delimited JSON-RPC requests from miners,
//! responses, push notifications, and the error-code table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct StratumRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Worker tag piggybacked on the request (eth-proxy style).
    #[serde(default)]
    pub worker: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReply>,
}

impl RpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0", id, result: Some(result), error: None }
    }

    pub fn error(id: Value, error: ErrorReply) -> Self {
        Self { jsonrpc: "2.0", id, result: None, error: Some(error) }
    }
}

/// New-job push; miners key on the fixed id 0.
#[derive(Debug, Clone, Serialize)]
pub struct PushMessage {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub result: Value,
}

impl PushMessage {
    pub fn job(result: Value) -> Self {
        Self { jsonrpc: "2.0", id: 0, result }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: i64,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn invalid_login() -> Self {
        Self::new(-1, "Invalid login")
    }

    pub fn blacklisted() -> Self {
        Self::new(-1, "You are blacklisted")
    }

    pub fn invalid_params() -> Self {
        Self::new(-1, "Invalid params")
    }

    pub fn invalid_ping() -> Self {
        Self::new(-1, "Invalid ping")
    }

    pub fn work_not_ready() -> Self {
        Self::new(0, "Work not ready")
    }

    pub fn method_not_found() -> Self {
        Self::new(-3, "Method not found")
    }
}

/// Submission failures with their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("Invalid params")]
    InvalidParams,
    #[error("Malformed PoW result")]
    MalformedPow,
    #[error("Duplicate share")]
    DuplicateShare,
    #[error("Invalid share")]
    InvalidShare,
    #[error("Not subscribed")]
    NotSubscribed,
    #[error("High rate of invalid shares")]
    HighInvalidRate,
}

impl SubmitError {
    pub fn code(&self) -> i64 {
        match self {
            SubmitError::InvalidParams => -1,
            SubmitError::MalformedPow => -1,
            SubmitError::DuplicateShare => 22,
            SubmitError::InvalidShare => 23,
            SubmitError::NotSubscribed => 25,
            SubmitError::HighInvalidRate => -1,
        }
    }

    pub fn reply(&self) -> ErrorReply {
        ErrorReply::new(self.code(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_parses_with_optional_worker() {
        let req: StratumRequest = serde_json::from_str(
            r#"{"id":1,"method":"eth_submitWork","params":["0x1"],"worker":"rig1"}"#,
        )
        .unwrap();
        assert_eq!(req.method, "eth_submitWork");
        assert_eq!(req.worker.as_deref(), Some("rig1"));

        let bare: StratumRequest =
            serde_json::from_str(r#"{"id":2,"method":"eth_getWork"}"#).unwrap();
        assert!(bare.params.is_none());
        assert!(bare.worker.is_none());
    }

    #[test]
    fn success_response_omits_error_field() {
        let resp = RpcResponse::result(json!(1), json!(true));
        let text = serde_json::to_string(&resp).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"result":true}"#);
    }

    #[test]
    fn error_response_carries_code_table_entries() {
        let resp = RpcResponse::error(json!(7), SubmitError::DuplicateShare.reply());
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains(r#""code":22"#));
        assert!(text.contains("Duplicate share"));

        assert_eq!(SubmitError::InvalidShare.code(), 23);
        assert_eq!(SubmitError::NotSubscribed.code(), 25);
        assert_eq!(SubmitError::MalformedPow.code(), -1);
        assert_eq!(ErrorReply::method_not_found().code, -3);
        assert_eq!(ErrorReply::work_not_ready().code, 0);
    }

    #[test]
    fn push_message_uses_id_zero() {
        let push = PushMessage::job(json!(["0xh", "0xs", "0xt"]));
        let text = serde_json::to_string(&push).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":0,"result":["0xh","0xs","0xt"]}"#);
    }
}
