//! Helpers for the unit tests in this crate.

use tokio::io::DuplexStream;

use crate::transport::ByteStreamTransport;

/// Initialize tracing once, with output routed to the test harness.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "debug";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .init();
    });
}

/// A connected pair of byte-stream transports, `(client, server)`, backed by an
/// in-process duplex pipe.
pub fn transport_pair() -> (
    ByteStreamTransport<DuplexStream>,
    ByteStreamTransport<DuplexStream>,
) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    (
        ByteStreamTransport::new(client),
        ByteStreamTransport::new(server),
    )
}
