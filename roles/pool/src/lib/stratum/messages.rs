//! Stratum wire messages.
//!
//! The downstream protocol is JSON-RPC over TCP with newline-delimited
//! messages. Requests carry `{id, method, params}`; responses are
//! `{id, result, error}` where `error` is either `null` or a
//! `[code, message, data]` triple; server-to-client notifications are
//! requests with a `null` id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id: miners send numbers or strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(u64),
    String(String),
}

/// An inbound request or notification.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Id>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Stratum error payload: `(code, message, data?)`.
#[derive(Debug, Clone, Serialize)]
pub struct RpcError(pub i64, pub String, pub Option<Value>);

/// An outbound response to a request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Id,
    pub result: Value,
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: Id, result: Value) -> Self {
        Response {
            id,
            result,
            error: None,
        }
    }

    pub fn err(id: Id, code: ErrorCode) -> Self {
        Response {
            id,
            result: Value::Bool(false),
            error: Some(RpcError(code.code(), code.message().to_string(), None)),
        }
    }
}

/// A server-to-client notification (`id: null`).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub id: Option<Id>,
    pub method: &'static str,
    pub params: Value,
}

impl Notification {
    pub fn new(method: &'static str, params: Value) -> Self {
        Notification {
            id: None,
            method,
            params,
        }
    }
}

/// Error codes reported on the stratum wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown,
    JobNotFound,
    DuplicateShare,
    LowDifficultyShare,
    Unauthorized,
    NotSubscribed,
}

impl ErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            ErrorCode::Unknown => 20,
            ErrorCode::JobNotFound => 21,
            ErrorCode::DuplicateShare => 22,
            ErrorCode::LowDifficultyShare => 23,
            ErrorCode::Unauthorized => 24,
            ErrorCode::NotSubscribed => 25,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::JobNotFound => "job-not-found",
            ErrorCode::DuplicateShare => "duplicate-share",
            ErrorCode::LowDifficultyShare => "low-difficulty-share",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::NotSubscribed => "not-subscribed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_numeric_and_string_ids() {
        let req: Request =
            serde_json::from_str(r#"{"id":1,"method":"mining.subscribe","params":["BzMiner"]}"#)
                .unwrap();
        assert_eq!(req.id, Some(Id::Number(1)));
        assert_eq!(req.method, "mining.subscribe");

        let req: Request =
            serde_json::from_str(r#"{"id":"a","method":"mining.authorize"}"#).unwrap();
        assert_eq!(req.id, Some(Id::String("a".to_string())));
        assert!(req.params.is_none());
    }

    #[test]
    fn parses_notification_without_id() {
        let req: Request =
            serde_json::from_str(r#"{"method":"mining.extranonce.subscribe","params":[]}"#)
                .unwrap();
        assert!(req.id.is_none());
    }

    #[test]
    fn ok_response_serializes_with_null_error() {
        let response = Response::ok(Id::Number(3), json!(true));
        let line = serde_json::to_string(&response).unwrap();
        assert_eq!(line, r#"{"id":3,"result":true,"error":null}"#);
    }

    #[test]
    fn error_response_uses_code_message_triple() {
        let response = Response::err(Id::Number(7), ErrorCode::JobNotFound);
        let line = serde_json::to_string(&response).unwrap();
        assert_eq!(
            line,
            r#"{"id":7,"result":false,"error":[21,"job-not-found",null]}"#
        );
    }

    #[test]
    fn notification_has_null_id() {
        let notification = Notification::new("mining.set_difficulty", json!([4096]));
        let line = serde_json::to_string(&notification).unwrap();
        assert_eq!(
            line,
            r#"{"id":null,"method":"mining.set_difficulty","params":[4096]}"#
        );
    }
}
