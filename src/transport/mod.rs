use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::Debug;

use crate::error::{TransportError, TransportResult};
use crate::wire::headers::StreamHeaders;

pub mod memory;

/// A duplex, frame-preserving stream supplied by a transport binding.
///
/// One stream backs exactly one channel once bound.
#[async_trait]
pub trait FrameStream: Send + Sync + Debug {
    /// Send one frame to the peer.
    async fn send_frame(&self, data: &[u8]) -> TransportResult<()>;

    /// Receive the next frame. `None` once the peer has finished writing.
    async fn recv_frame(&self) -> TransportResult<Option<Bytes>>;

    /// Terminate the stream in both directions.
    async fn close(&self) -> TransportResult<()>;

    /// Whether `push` can open sub-streams on this stream.
    fn supports_push(&self) -> bool {
        false
    }

    /// Open a sub-stream labelled with `headers` as a child of this stream.
    async fn push(&self, _headers: StreamHeaders) -> TransportResult<Box<dyn FrameStream>> {
        Err(TransportError::PushUnsupported(self.name().to_string()))
    }

    fn stats(&self) -> Option<TransportStats> {
        None
    }

    fn name(&self) -> &str {
        "unknown"
    }
}

/// A stream opened by the peer, with the headers it arrived with.
#[derive(Debug)]
pub struct InboundStream {
    pub headers: StreamHeaders,
    pub stream: Box<dyn FrameStream>,
}

/// One physical connection, as seen by a session.
#[async_trait]
pub trait Connection: Send + Sync + Debug {
    /// Open a fresh top-level stream towards the peer.
    async fn open_stream(&self, headers: StreamHeaders) -> TransportResult<Box<dyn FrameStream>>;

    /// Wait for the next stream opened or pushed by the peer.
    /// `None` once the connection is gone.
    async fn accept_stream(&self) -> TransportResult<Option<InboundStream>>;

    async fn close(&self) -> TransportResult<()>;

    fn name(&self) -> &str {
        "unknown"
    }
}

/// Statistics collected by stream implementations
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    pub recv_errors: u64,
    pub streams_pushed: u64,
}

#[async_trait]
impl<T: FrameStream + ?Sized> FrameStream for std::sync::Arc<T> {
    async fn send_frame(&self, data: &[u8]) -> TransportResult<()> {
        (**self).send_frame(data).await
    }

    async fn recv_frame(&self) -> TransportResult<Option<Bytes>> {
        (**self).recv_frame().await
    }

    async fn close(&self) -> TransportResult<()> {
        (**self).close().await
    }

    fn supports_push(&self) -> bool {
        (**self).supports_push()
    }

    async fn push(&self, headers: StreamHeaders) -> TransportResult<Box<dyn FrameStream>> {
        (**self).push(headers).await
    }

    fn stats(&self) -> Option<TransportStats> {
        (**self).stats()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<T: FrameStream + ?Sized> FrameStream for Box<T> {
    async fn send_frame(&self, data: &[u8]) -> TransportResult<()> {
        (**self).send_frame(data).await
    }

    async fn recv_frame(&self) -> TransportResult<Option<Bytes>> {
        (**self).recv_frame().await
    }

    async fn close(&self) -> TransportResult<()> {
        (**self).close().await
    }

    fn supports_push(&self) -> bool {
        (**self).supports_push()
    }

    async fn push(&self, headers: StreamHeaders) -> TransportResult<Box<dyn FrameStream>> {
        (**self).push(headers).await
    }

    fn stats(&self) -> Option<TransportStats> {
        (**self).stats()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

#[async_trait]
impl<T: Connection + ?Sized> Connection for std::sync::Arc<T> {
    async fn open_stream(&self, headers: StreamHeaders) -> TransportResult<Box<dyn FrameStream>> {
        (**self).open_stream(headers).await
    }

    async fn accept_stream(&self) -> TransportResult<Option<InboundStream>> {
        (**self).accept_stream().await
    }

    async fn close(&self) -> TransportResult<()> {
        (**self).close().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
