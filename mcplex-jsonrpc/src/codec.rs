//! Bidirectional mapping between raw JSON text and typed [`Message`]s.
//!
//! Classification follows the JSON-RPC 2.0 shape rules: `method` + `id` is a request,
//! `method` alone is a notification, `id` alone is a response, anything else is a parse
//! error.  Serialization emits exactly the fields each shape requires, always including
//! the `"jsonrpc":"2.0"` tag and never emitting null-valued optional fields.

use serde_json::{Map, Value as JsonValue, json};

use crate::error::{JsonRpcError, Result};
use crate::types::{ErrorDetails, Id, Message, Notification, Request, Response, ResponsePayload};
use crate::JSONRPC_VERSION;

/// Parse one JSON object into a [`Message`].
///
/// The raw slice must contain exactly one JSON object; trailing garbage is an error.
pub fn parse(raw: &str) -> Result<Message> {
    let value: JsonValue =
        serde_json::from_str(raw).map_err(|source| JsonRpcError::ParseJson { source })?;
    let JsonValue::Object(object) = value else {
        return Err(JsonRpcError::NotAnObject);
    };
    parse_object(object)
}

/// Parse a JSON array into a sequence of [`Message`]s.
///
/// An empty array yields an empty sequence.  A non-object element fails the whole
/// batch.
pub fn parse_batch(raw: &str) -> Result<Vec<Message>> {
    let value: JsonValue =
        serde_json::from_str(raw).map_err(|source| JsonRpcError::ParseJson { source })?;
    let JsonValue::Array(elements) = value else {
        return Err(JsonRpcError::NotAnArray);
    };

    let mut messages = Vec::with_capacity(elements.len());
    for (index, element) in elements.into_iter().enumerate() {
        let JsonValue::Object(object) = element else {
            return Err(JsonRpcError::BatchElementNotAnObject { index });
        };
        messages.push(parse_object(object)?);
    }
    Ok(messages)
}

/// Serialize one [`Message`] to a JSON string.
pub fn serialize(message: &Message) -> Result<String> {
    let value = to_value(message);
    serde_json::to_string(&value).map_err(|source| JsonRpcError::Serialize {
        source,
        type_name: std::any::type_name::<Message>(),
    })
}

/// Serialize a sequence of messages to a JSON array.
pub fn serialize_batch(messages: &[Message]) -> Result<String> {
    let values: Vec<JsonValue> = messages.iter().map(to_value).collect();
    serde_json::to_string(&values).map_err(|source| JsonRpcError::Serialize {
        source,
        type_name: std::any::type_name::<Vec<Message>>(),
    })
}

fn parse_object(mut object: Map<String, JsonValue>) -> Result<Message> {
    match object.get("jsonrpc") {
        Some(JsonValue::String(tag)) if tag == JSONRPC_VERSION => {}
        _ => return Err(JsonRpcError::BadProtocolTag),
    }

    let has_method = object.contains_key("method");
    let has_id = object.contains_key("id");

    match (has_method, has_id) {
        (true, true) => {
            let id = parse_id(object.remove("id").unwrap_or(JsonValue::Null))?;
            let method = parse_method(object.remove("method"))?;
            Ok(Message::Request(Request {
                id,
                method,
                params: object.remove("params"),
                meta: object.remove("_meta"),
            }))
        }
        (true, false) => {
            let method = parse_method(object.remove("method"))?;
            Ok(Message::Notification(Notification {
                method,
                params: object.remove("params"),
            }))
        }
        (false, true) => {
            let id = parse_id(object.remove("id").unwrap_or(JsonValue::Null))?;
            let payload = match (object.remove("result"), object.remove("error")) {
                (Some(result), None) => ResponsePayload::Success(result),
                (None, Some(error)) => {
                    let details: ErrorDetails = serde_json::from_value(error)
                        .map_err(|_| JsonRpcError::BadErrorObject)?;
                    ResponsePayload::Error(details)
                }
                _ => return Err(JsonRpcError::BadResponsePayload),
            };
            Ok(Message::Response(Response { id, payload }))
        }
        (false, false) => Err(JsonRpcError::AmbiguousShape),
    }
}

fn parse_id(value: JsonValue) -> Result<Id> {
    match value {
        JsonValue::Null => Err(JsonRpcError::NullId),
        // serde_json keeps u64 values exact; ids above i64::MAX arrive intact and are
        // never converted to floats.
        JsonValue::Number(num) => num.as_u64().map(Id::Number).ok_or(JsonRpcError::BadId),
        JsonValue::String(s) => Ok(Id::Str(s)),
        _ => Err(JsonRpcError::BadId),
    }
}

fn parse_method(value: Option<JsonValue>) -> Result<String> {
    match value {
        Some(JsonValue::String(method)) if !method.is_empty() => Ok(method),
        _ => Err(JsonRpcError::BadMethod),
    }
}

fn to_value(message: &Message) -> JsonValue {
    match message {
        Message::Request(req) => {
            let mut value = json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": &req.id,
                "method": &req.method,
            });
            if let Some(params) = &req.params {
                value["params"] = params.clone();
            }
            if let Some(meta) = &req.meta {
                value["_meta"] = meta.clone();
            }
            value
        }
        Message::Notification(notif) => {
            let mut value = json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": &notif.method,
            });
            if let Some(params) = &notif.params {
                value["params"] = params.clone();
            }
            value
        }
        Message::Response(resp) => match &resp.payload {
            ResponsePayload::Success(result) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": &resp.id,
                "result": result,
            }),
            ResponsePayload::Error(error) => json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": &resp.id,
                "error": error,
            }),
        },
    }
}
