//! A Rust implementation of the JSON-RPC 2.0 message layer, specific to `mcplex`.
//!
//! This crate isn't intended as a general-purpose JSON-RPC library; it's purpose-built
//! for the MCP implementation in the `mcplex` crate.  It deliberately contains no I/O
//! and no async code: just the typed message model and a codec that maps between raw
//! JSON text and those types.
//!
//! The codec is hand-rolled over [`serde_json::Value`] rather than relying on serde's
//! untagged-enum deserialization, because the JSON-RPC shape rules (a request has both
//! `method` and a non-null `id`, a response has `id` but no `method`, and so on) have
//! error cases that need to be reported precisely, not as "no variant matched".

mod codec;
mod error;
mod types;

pub use codec::{parse, parse_batch, serialize, serialize_batch};
pub use error::{JsonRpcError, Result};
pub use types::{
    ErrorCode, ErrorDetails, Id, Message, Notification, Request, Response, ResponsePayload,
};

/// The only protocol tag this codec will emit or accept.
pub const JSONRPC_VERSION: &str = "2.0";
