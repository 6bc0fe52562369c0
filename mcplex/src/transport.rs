//! The transport abstraction: a source and sink of already-framed JSON-RPC messages.
//!
//! A transport's job is framing and byte movement only.  The peer runtime drives it
//! from its event loop, so the trait is a pull-based pair of async operations rather
//! than a callback registration: `receive_message` resolves to the next inbound frame
//! (or `None` once the connection is gone) and `send_message` completes once a frame
//! has been handed to the underlying byte layer.  FIFO order is preserved in both
//! directions.
//!
//! Two concrete transports live here and in the [`http`] submodule: newline-delimited
//! framing over any byte-stream pair (stdio, pipes, an in-process duplex for tests),
//! and the Streamable HTTP transport.

pub mod http;

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{FutureExt, SinkExt, StreamExt, TryFutureExt};
use mcplex_jsonrpc::{ErrorDetails, Message};
use tokio::io::{AsyncRead, AsyncWrite, Join, Stdin, Stdout};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::error::{McpError, Result};

/// One item delivered by a transport.
///
/// Framing errors that are scoped to a single frame (bad JSON on one line) arrive as
/// [`TransportEvent::Malformed`] so the runtime can answer with an `id:null` parse
/// error and keep the session alive; only unrecoverable failures surface as `Err`.
#[derive(Debug)]
pub enum TransportEvent {
    Message(Message),
    Malformed(ErrorDetails),
}

/// A source and sink of JSON-RPC messages over some underlying byte layer.
pub trait Transport: Send + Sized + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// A span carrying useful metadata about the transport; the runtime enters it for
    /// all work on this connection.
    fn span(&self) -> tracing::Span;

    /// Submit one message for delivery.  Completes when the frame has been handed off
    /// to the underlying layer.  Frames are delivered in submission order.
    fn send_message(
        &mut self,
        message: Message,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Resolve to the next inbound frame, or `Ok(None)` once the connection is closed
    /// and no more frames will arrive.  Must be cancel-safe: the runtime polls this
    /// inside a `select!`.
    fn receive_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<TransportEvent>, Self::Error>> + Send + '_;
}

/// Dyn-compatible mirror of [`Transport`] so the runtime can hold any transport behind
/// one pointer, with errors normalized to [`McpError`].
trait ErasedTransport: Send + 'static {
    fn erased_span(&self) -> tracing::Span;
    fn erased_send(&mut self, message: Message) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
    fn erased_receive(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<TransportEvent>>> + Send + '_>>;
}

impl<T: Transport> ErasedTransport for T {
    fn erased_span(&self) -> tracing::Span {
        <Self as Transport>::span(self)
    }

    fn erased_send(&mut self, message: Message) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        <Self as Transport>::send_message(self, message)
            .map_err(McpError::transport)
            .boxed()
    }

    fn erased_receive(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<TransportEvent>>> + Send + '_>> {
        <Self as Transport>::receive_message(self)
            .map_err(McpError::transport)
            .boxed()
    }
}

/// Type-erased handle to a transport, owned by the peer runtime.
///
/// The inner async mutex exists so send and receive can both be driven through `&self`
/// from the event loop's `select!` arms; contention is nil because the event loop is
/// the only caller.
pub struct Link {
    span: tracing::Span,
    connected: AtomicBool,
    transport: tokio::sync::Mutex<Box<dyn ErasedTransport>>,
}

impl Link {
    pub fn new(transport: impl Transport) -> Self {
        let span = transport.span();
        Self {
            span,
            connected: AtomicBool::new(true),
            transport: tokio::sync::Mutex::new(Box::new(transport)),
        }
    }

    pub fn span(&self) -> tracing::Span {
        self.span.clone()
    }

    /// Liveness hint.  Turns false once the transport reports end-of-stream or a
    /// fatal error.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn send_message(&self, message: Message) -> Result<()> {
        let result = self.transport.lock().await.erased_send(message).await;
        if result.is_err() {
            self.connected.store(false, Ordering::Relaxed);
        }
        result
    }

    pub async fn receive_message(&self) -> Result<Option<TransportEvent>> {
        let result = self.transport.lock().await.erased_receive().await;
        match &result {
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => self.connected.store(false, Ordering::Relaxed),
        }
        result
    }
}

/// Newline-delimited JSON framing over any byte stream: one message per `\n`-terminated
/// line, a trailing `\r` tolerated, blank lines skipped.  This is the stdio transport
/// when constructed over stdin/stdout, and the test transport when constructed over an
/// in-process duplex pipe.
pub struct ByteStreamTransport<Io> {
    framed: Framed<Io, LinesCodec>,
}

impl<Io> ByteStreamTransport<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(io: Io) -> Self {
        Self {
            framed: Framed::new(io, LinesCodec::new()),
        }
    }

    /// Like [`Self::new`] but rejecting frames longer than `max` bytes; oversized
    /// frames surface as a fatal transport error.
    pub fn with_max_frame_length(io: Io, max: usize) -> Self {
        Self {
            framed: Framed::new(io, LinesCodec::new_with_max_length(max)),
        }
    }
}

impl<R, W> ByteStreamTransport<Join<R, W>>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Build a transport from separate read and write halves, e.g. a child process's
    /// stdout and stdin.
    pub fn from_pair(reader: R, writer: W) -> Self {
        Self::new(tokio::io::join(reader, writer))
    }
}

impl ByteStreamTransport<Join<Stdin, Stdout>> {
    /// The transport for a server launched as a subprocess: frames in on stdin, out on
    /// stdout.
    pub fn stdio() -> Self {
        Self::from_pair(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl<Io> Transport for ByteStreamTransport<Io>
where
    Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    type Error = LinesCodecError;

    fn span(&self) -> tracing::Span {
        tracing::debug_span!("byte_stream", io = std::any::type_name::<Io>())
    }

    fn send_message(
        &mut self,
        message: Message,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_ {
        async move {
            let line = mcplex_jsonrpc::serialize(&message)
                .map_err(|e| LinesCodecError::Io(std::io::Error::other(e)))?;
            self.framed.send(line).await
        }
    }

    fn receive_message(
        &mut self,
    ) -> impl Future<Output = Result<Option<TransportEvent>, Self::Error>> + Send + '_ {
        async move {
            loop {
                // StreamExt::next does not take ownership of the stream, so dropping
                // this future mid-poll loses no input.
                match self.framed.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(line)) => {
                        let line = line.trim_end_matches('\r');
                        if line.is_empty() {
                            continue;
                        }
                        match mcplex_jsonrpc::parse(line) {
                            Ok(message) => return Ok(Some(TransportEvent::Message(message))),
                            Err(e) => {
                                tracing::error!(err = %e, "discarding malformed inbound frame");
                                return Ok(Some(TransportEvent::Malformed((&e).into())));
                            }
                        }
                    }
                }
            }
        }
    }
}
