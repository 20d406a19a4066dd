#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chanpass::transport::memory::{self, MemoryConfig, MemoryConnection};
use chanpass::{
    ChannelId, Connection, FrameStream, InboundStream, Session, StreamHeaders, TransportError,
    TransportResult,
};

/// Init tracing subscriber (idempotent across tests via try_init).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_test_writer()
        .try_init();
}

/// A raw connection pair. The first end plays the remote peer, streams it
/// opens arrive at the second end.
pub fn raw_pair() -> (MemoryConnection, MemoryConnection) {
    memory::pair("raw", MemoryConfig::default())
}

/// Open a stream from `peer` and hand its far half to `session`. Returns
/// the peer's half.
pub async fn deliver(
    peer: &MemoryConnection,
    local: &MemoryConnection,
    session: &Session,
    id: u32,
    parent: Option<u32>,
) -> Box<dyn FrameStream> {
    let near = peer
        .open_stream(StreamHeaders::for_channel(ChannelId(id), parent.map(ChannelId)))
        .await
        .unwrap();
    let InboundStream { headers, stream } = local.accept_stream().await.unwrap().unwrap();
    session.on_inbound_stream(headers, stream).await.unwrap();
    near
}

/// Poll `check` until it holds, yielding to other tasks in between.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Stream double with scripted push and close behavior.
#[derive(Debug, Default)]
pub struct StubStream {
    pub can_push: bool,
    pub fail_push: bool,
    pub fail_close: bool,
    pub closes: AtomicUsize,
}

impl StubStream {
    pub fn failing_push() -> Self {
        Self {
            can_push: true,
            fail_push: true,
            ..Default::default()
        }
    }

    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl FrameStream for StubStream {
    async fn send_frame(&self, _data: &[u8]) -> TransportResult<()> {
        Ok(())
    }

    async fn recv_frame(&self) -> TransportResult<Option<Bytes>> {
        std::future::pending().await
    }

    async fn close(&self) -> TransportResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn supports_push(&self) -> bool {
        self.can_push
    }

    async fn push(&self, _headers: StreamHeaders) -> TransportResult<Box<dyn FrameStream>> {
        if self.fail_push {
            return Err(TransportError::PushFailed("refused by stub".into()));
        }
        Ok(Box::new(StubStream::default()))
    }

    fn name(&self) -> &str {
        "stub"
    }
}
