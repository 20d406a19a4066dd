use bytes::Bytes;
use std::sync::Arc;
use tracing::trace;

use super::Channel;
use super::endpoint::{ChannelState, EndpointCore};
use crate::error::Result;
use crate::session::Session;
use crate::transport::FrameStream;
use crate::wire::types::{ChannelId, EndpointKind};

/// A raw, bidirectional byte endpoint. No message framing beyond what the
/// transport delivers per write.
#[derive(Clone)]
pub struct ByteStream {
    core: Arc<EndpointCore>,
}

impl ByteStream {
    pub(crate) fn from_core(core: Arc<EndpointCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<EndpointCore> {
        &self.core
    }

    pub fn id(&self) -> ChannelId {
        self.core.id()
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    pub fn parent_id(&self) -> Option<ChannelId> {
        self.core.parent_id()
    }

    pub fn parent(&self) -> Option<Channel> {
        let parent = self.core.parent()?;
        match parent.kind() {
            EndpointKind::Channel(direction) => Some(Channel::from_core(parent, direction)),
            EndpointKind::ByteStream => None,
        }
    }

    pub fn session(&self) -> Result<Session> {
        self.core.session()
    }

    pub async fn handle(&self, stream: Box<dyn FrameStream>) -> Result<()> {
        self.core.bind(stream).await
    }

    pub async fn wait_bound(&self) -> Result<()> {
        self.core.bound_stream().await.map(|_| ())
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let stream = self.core.bound_stream().await?;
        stream.send_frame(data).await?;
        trace!(channel_id = %self.id(), bytes = data.len(), "bytes written");
        Ok(())
    }

    /// Next chunk of bytes. `None` once the peer has finished writing,
    /// which also closes the stream.
    pub async fn read(&self) -> Result<Option<Bytes>> {
        let stream = self.core.bound_stream().await?;
        match stream.recv_frame().await? {
            Some(chunk) => Ok(Some(chunk)),
            None => {
                self.core.shutdown(false).await?;
                Ok(None)
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.core.shutdown(false).await
    }

    pub async fn force_close(&self) -> Result<()> {
        self.core.shutdown(true).await
    }

    pub async fn closed(&self) {
        self.core.closed().await
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
