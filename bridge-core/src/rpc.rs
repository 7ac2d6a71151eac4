//! JSON-RPC envelope codec for the Verto control channel.

use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Error code used when replying to a server request we could not handle.
pub const HANDLER_ERROR_CODE: i64 = -32000;
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;

/// Methods spoken on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VertoMethod {
    Login,
    Invite,
    Answer,
    Bye,
    Media,
    Display,
    ClientReady,
    Punt,
    Other(String),
}

impl VertoMethod {
    pub fn parse(method: &str) -> Self {
        match method {
            "login" => Self::Login,
            "verto.invite" => Self::Invite,
            "verto.answer" => Self::Answer,
            "verto.bye" => Self::Bye,
            "verto.media" => Self::Media,
            "verto.display" => Self::Display,
            "verto.clientReady" => Self::ClientReady,
            "verto.punt" => Self::Punt,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Login => "login",
            Self::Invite => "verto.invite",
            Self::Answer => "verto.answer",
            Self::Bye => "verto.bye",
            Self::Media => "verto.media",
            Self::Display => "verto.display",
            Self::ClientReady => "verto.clientReady",
            Self::Punt => "verto.punt",
            Self::Other(method) => method,
        }
    }
}

impl fmt::Display for VertoMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `error` object returned by the remote platform.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("code {code}: {message}")]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
    /// The complete response message the error arrived in.
    pub raw: Value,
}

impl Eq for RemoteError {}

impl RemoteError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            raw: Value::Null,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("message is not valid JSON: {0}")]
    Json(String),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("response has no usable id")]
    MissingId,
    #[error("message is neither a request nor a response")]
    Unrecognized,
}

/// An inbound control-channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Response { id: u64, result: Value },
    Error { id: u64, error: RemoteError },
    /// A server-initiated request. `id` is absent for notifications.
    Request {
        id: Option<Value>,
        method: String,
        params: Value,
    },
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a Value,
}

pub fn encode_request(id: u64, method: &str, params: &Value) -> String {
    let envelope = RequestEnvelope {
        jsonrpc: JSONRPC_VERSION,
        id,
        method,
        params,
    };
    serde_json::to_string(&envelope).unwrap_or_default()
}

pub fn encode_result(id: &Value, result: Value) -> String {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }).to_string()
}

pub fn encode_error(id: &Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message }
    })
    .to_string()
}

pub fn decode(text: &str) -> Result<RpcMessage, DecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        return Ok(RpcMessage::Request {
            id: object.get("id").cloned(),
            method: method.to_string(),
            params: object.get("params").cloned().unwrap_or(Value::Null),
        });
    }

    if let Some(error) = object.get("error") {
        let id = response_id(object.get("id"))?;
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Ok(RpcMessage::Error {
            id,
            error: RemoteError {
                code,
                message,
                raw: value.clone(),
            },
        });
    }

    if let Some(result) = object.get("result") {
        let id = response_id(object.get("id"))?;
        return Ok(RpcMessage::Response {
            id,
            result: result.clone(),
        });
    }

    Err(DecodeError::Unrecognized)
}

fn response_id(id: Option<&Value>) -> Result<u64, DecodeError> {
    match id {
        Some(Value::Number(n)) => n.as_u64().ok_or(DecodeError::MissingId),
        Some(Value::String(s)) => s.parse().map_err(|_| DecodeError::MissingId),
        _ => Err(DecodeError::MissingId),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_requests_with_envelope() {
        let text = encode_request(3, "verto.bye", &json!({"sessid": "s"}));
        let value: Value = serde_json::from_str(&text).expect("valid json");
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 3, "method": "verto.bye", "params": {"sessid": "s"}})
        );
    }

    #[test]
    fn decodes_results_and_errors() {
        assert_eq!(
            decode(r#"{"jsonrpc":"2.0","id":1,"result":{"message":"logged in"}}"#),
            Ok(RpcMessage::Response {
                id: 1,
                result: json!({"message": "logged in"})
            })
        );

        match decode(r#"{"jsonrpc":"2.0","id":"2","error":{"code":-32001,"message":"Authentication Required"}}"#) {
            Ok(RpcMessage::Error { id, error }) => {
                assert_eq!(id, 2);
                assert_eq!(error.code, -32001);
                assert_eq!(error.message, "Authentication Required");
                assert_eq!(error.raw["id"], "2");
            }
            other => panic!("unexpected decode result {other:?}"),
        }
    }

    #[test]
    fn decodes_server_requests() {
        let decoded = decode(r#"{"jsonrpc":"2.0","id":77,"method":"verto.bye","params":{"callID":"c1"}}"#)
            .expect("valid request");
        assert_eq!(
            decoded,
            RpcMessage::Request {
                id: Some(json!(77)),
                method: "verto.bye".into(),
                params: json!({"callID": "c1"}),
            }
        );
        assert_eq!(VertoMethod::parse("verto.bye"), VertoMethod::Bye);
        assert_eq!(VertoMethod::parse("verto.info").as_str(), "verto.info");
    }

    #[test]
    fn reports_garbage() {
        assert!(matches!(decode("not json"), Err(DecodeError::Json(_))));
        assert_eq!(decode("[1,2]"), Err(DecodeError::NotAnObject));
        assert_eq!(decode(r#"{"jsonrpc":"2.0","result":{}}"#), Err(DecodeError::MissingId));
        assert_eq!(decode(r#"{"jsonrpc":"2.0","id":4}"#), Err(DecodeError::Unrecognized));
    }
}
