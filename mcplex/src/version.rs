//! Protocol version constants and negotiation.

/// The newest MCP revision this implementation speaks.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// All revisions this implementation can interoperate with, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Pick the version a server answers with during `initialize`.
///
/// The requested version wins when we support it; otherwise we answer with our newest
/// and leave it to the client to reject the session if it cannot speak that.
pub fn negotiate(requested: &str) -> &'static str {
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == requested)
        .copied()
        .unwrap_or(PROTOCOL_VERSION)
}

pub fn is_supported(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}
