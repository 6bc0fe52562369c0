use mcplex_jsonrpc::{ErrorCode, ErrorDetails, JsonRpcError};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub type Result<T, E = McpError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("codec error")]
    Codec {
        #[from]
        source: JsonRpcError,
    },

    #[error("transport error")]
    Transport {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// The transport was shut down, or the connection was lost, before the operation
    /// could complete.  Pending outbound calls fail with this when the session ends.
    #[error("transport closed")]
    TransportClosed,

    #[error("request '{method}' timed out")]
    Timeout { method: String },

    /// The remote peer answered with an error response.  The code and message are
    /// preserved verbatim.
    #[error("method '{method}' failed with error {}: {}", error.code, error.message)]
    Method { method: String, error: ErrorDetails },

    #[error("error serializing request parameters for {type_name}")]
    SerRequest {
        #[source]
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("error deserializing response into {type_name}")]
    DeserResponse {
        #[source]
        source: serde_json::Error,
        type_name: &'static str,
        response: JsonValue,
    },

    #[error("peer negotiated unsupported protocol version '{version}'")]
    UnsupportedProtocolVersion { version: String },

    #[error("operation requires the remote peer to advertise the '{capability}' capability")]
    CapabilityNotAdvertised { capability: &'static str },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("BUG: {message}")]
    Bug { message: String },
}

impl McpError {
    pub(crate) fn transport(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        McpError::Transport {
            source: Box::new(source),
        }
    }

    /// The JSON-RPC error code carried by this error, if the remote peer supplied one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            McpError::Method { error, .. } => Some(error.code),
            _ => None,
        }
    }
}

/// Anything that goes wrong while handling a remote request has to be reportable on the
/// wire.  The conversion is deliberately lossy: internals stay in the logs.
impl From<&McpError> for ErrorDetails {
    fn from(err: &McpError) -> Self {
        match err {
            McpError::Codec { source } => source.into(),
            McpError::Method { error, .. } => error.clone(),
            McpError::Timeout { method } => {
                ErrorDetails::internal_error(format!("request '{method}' timed out"), None)
            }
            McpError::Bug { .. } => ErrorDetails::internal_error("Unexpected internal error", None),
            other => ErrorDetails::internal_error(other.to_string(), None),
        }
    }
}
