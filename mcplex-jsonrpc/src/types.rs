//! Typed representations of JSON-RPC 2.0 messages.
//!
//! These structs do not carry the `"jsonrpc":"2.0"` tag as a field; the codec validates
//! it on the way in and emits it on the way out.  That keeps two invariants true by
//! construction: a [`Response`] holds exactly one of a result or an error, and parsed
//! requests and responses always have non-null ids.

use std::fmt::Display;

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A JSON-RPC request id.
///
/// Remote peers may use integer or string ids and we preserve whichever form arrived.
/// `Null` never appears in a parsed message; it exists only so that parse-error
/// responses can be addressed to `"id": null` as the spec requires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Id {
    Null,
    /// Numeric id.  Unsigned so that ids above `i64::MAX` survive a round trip.
    Number(u64),
    Str(String),
}

impl Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Id::Null => write!(f, "null"),
            Id::Number(num) => write!(f, "{num}"),
            Id::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<u64> for Id {
    fn from(num: u64) -> Self {
        Id::Number(num)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::Str(s.to_string())
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Id::Null => serializer.serialize_none(),
            Id::Number(num) => serializer.serialize_u64(*num),
            Id::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        match value {
            JsonValue::Null => Ok(Id::Null),
            JsonValue::Number(num) => num
                .as_u64()
                .map(Id::Number)
                .ok_or_else(|| serde::de::Error::custom("id must be a non-negative integer")),
            JsonValue::String(s) => Ok(Id::Str(s)),
            _ => Err(serde::de::Error::custom("id must be an integer or a string")),
        }
    }
}

/// A JSON-RPC method call: has both an id and a method name.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Id,
    pub method: String,
    pub params: Option<JsonValue>,
    /// The `_meta` field carries out-of-band metadata such as progress tokens.
    /// Preserved verbatim.
    pub meta: Option<JsonValue>,
}

impl Request {
    pub fn new(id: impl Into<Id>, method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params: params.into(),
            meta: None,
        }
    }
}

/// A JSON-RPC notification: a method name with no id, so no response is possible.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<JsonValue>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: impl Into<Option<JsonValue>>) -> Self {
        Self {
            method: method.into(),
            params: params.into(),
        }
    }
}

/// A JSON-RPC response, carrying exactly one of a result or an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Id,
    pub payload: ResponsePayload,
}

impl Response {
    pub fn new(id: Id, payload: ResponsePayload) -> Self {
        Self { id, payload }
    }

    pub fn success(id: Id, result: JsonValue) -> Self {
        Self::new(id, ResponsePayload::Success(result))
    }

    pub fn error(id: Id, error: impl Into<ErrorDetails>) -> Self {
        Self::new(id, ResponsePayload::Error(error.into()))
    }
}

/// The payload of a [`Response`].  `result` XOR `error`, enforced by the type.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Success(JsonValue),
    Error(ErrorDetails),
}

impl ResponsePayload {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponsePayload::Success(_))
    }
}

/// Numeric JSON-RPC error codes, including the MCP-specific server error range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    ResourceNotFound,
    Other(i64),
}

impl ErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ResourceNotFound => -32002,
            ErrorCode::Other(code) => *code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32002 => ErrorCode::ResourceNotFound,
            other => ErrorCode::Other(other),
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Ok(ErrorCode::from(code))
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data: data.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ParseError, message, data)
    }

    pub fn invalid_request(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, data)
    }

    pub fn method_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message, data)
    }

    pub fn invalid_params(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InvalidParams, message, data)
    }

    pub fn internal_error(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::InternalError, message, data)
    }

    pub fn resource_not_found(message: impl Into<String>, data: impl Into<Option<JsonValue>>) -> Self {
        Self::new(ErrorCode::ResourceNotFound, message, data)
    }
}

/// Every valid JSON-RPC message that can appear on the wire, as a tagged sum.
///
/// Batches are deliberately not a variant: a batch is a sequence of messages, and the
/// codec exposes it as such via [`crate::parse_batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// The method name, for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(notif) => Some(&notif.method),
            Message::Response(_) => None,
        }
    }

    /// The id, for requests and responses.
    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Request(req) => Some(&req.id),
            Message::Response(resp) => Some(&resp.id),
            Message::Notification(_) => None,
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Message::Request(req)
    }
}

impl From<Notification> for Message {
    fn from(notif: Notification) -> Self {
        Message::Notification(notif)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Message::Response(resp)
    }
}
