use thiserror::Error;

use crate::types::ErrorDetails;

pub type Result<T, E = JsonRpcError> = std::result::Result<T, E>;

/// Everything that can go wrong while decoding or encoding JSON-RPC messages.
///
/// All of the decode variants correspond to the JSON-RPC `-32700` parse error when
/// reported to the remote peer; they are separate variants so that local callers and
/// log output can tell exactly which rule a frame violated.
#[derive(Debug, Error)]
pub enum JsonRpcError {
    #[error("error parsing JSON")]
    ParseJson {
        #[source]
        source: serde_json::Error,
    },

    #[error("message root must be a JSON object")]
    NotAnObject,

    #[error("batch root must be a JSON array")]
    NotAnArray,

    #[error("batch element {index} is not a JSON object")]
    BatchElementNotAnObject { index: usize },

    #[error("missing or invalid 'jsonrpc' field, expected the literal \"2.0\"")]
    BadProtocolTag,

    #[error("the 'id' field must not be null")]
    NullId,

    #[error("the 'id' field must be an integer or a string")]
    BadId,

    #[error("the 'method' field must be a non-empty string")]
    BadMethod,

    #[error("a response must carry exactly one of 'result' or 'error'")]
    BadResponsePayload,

    #[error("cannot classify message: it has neither 'method' nor 'id'")]
    AmbiguousShape,

    #[error("malformed 'error' object in response")]
    BadErrorObject,

    #[error("error serializing {type_name} to JSON")]
    Serialize {
        #[source]
        source: serde_json::Error,
        type_name: &'static str,
    },
}

/// Every decode failure is reportable on the wire as a JSON-RPC error.
///
/// Note that the resulting message is sent to the remote peer, so the conversion stays
/// terse and does not echo raw input back.
impl From<&JsonRpcError> for ErrorDetails {
    fn from(err: &JsonRpcError) -> Self {
        match err {
            JsonRpcError::Serialize { .. } => {
                ErrorDetails::internal_error("Error serializing response", None)
            }
            other => ErrorDetails::parse_error(other.to_string(), None),
        }
    }
}
