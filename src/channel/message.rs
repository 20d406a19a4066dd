//! Directional message channels.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::trace;

use super::ByteStream;
use super::endpoint::{ChannelState, EndpointCore};
use crate::codec::Encoder;
use crate::error::{ChanError, Result};
use crate::session::Session;
use crate::transport::FrameStream;
use crate::wire::types::{ChannelId, Direction, EndpointKind};

/// A directional, session-scoped message endpoint.
///
/// A write channel sends values, a read channel receives them, one
/// MessagePack document per frame. Values may themselves contain channels
/// and byte streams. Clones are handles to the same channel.
#[derive(Clone)]
pub struct Channel {
    core: Arc<EndpointCore>,
    direction: Direction,
}

impl Channel {
    pub(crate) fn from_core(core: Arc<EndpointCore>, direction: Direction) -> Self {
        Self { core, direction }
    }

    pub(crate) fn core(&self) -> &Arc<EndpointCore> {
        &self.core
    }

    pub fn id(&self) -> ChannelId {
        self.core.id()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// Id of the channel this one was established through, if any.
    pub fn parent_id(&self) -> Option<ChannelId> {
        self.core.parent_id()
    }

    /// The parent channel, while it is still alive.
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

    /// Bind the channel to a transport stream. A channel is bound at most
    /// once; a rejected stream is closed.
    pub async fn handle(&self, stream: Box<dyn FrameStream>) -> Result<()> {
        self.core.bind(stream).await
    }

    /// Wait until the channel is bound, or fail with the error that
    /// prevented it.
    pub async fn wait_bound(&self) -> Result<()> {
        self.core.bound_stream().await.map(|_| ())
    }

    pub async fn send<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        self.expect(Direction::Write)?;
        let stream = self.core.bound_stream().await?;
        let frame = self.encoder()?.encode(value)?;
        stream.send_frame(&frame).await?;
        trace!(channel_id = %self.id(), bytes = frame.len(), "message sent");
        Ok(())
    }

    /// Receive the next value. `None` once the peer has finished writing,
    /// at which point the channel is closed.
    pub async fn recv<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.expect(Direction::Read)?;
        let stream = self.core.bound_stream().await?;
        match stream.recv_frame().await? {
            Some(frame) => {
                trace!(channel_id = %self.id(), bytes = frame.len(), "message received");
                self.encoder()?.decode(&frame).map(Some)
            }
            None => {
                self.core.shutdown(false).await?;
                Ok(None)
            }
        }
    }

    /// Create a channel established through this one.
    pub fn create_channel(&self, direction: Direction) -> Result<Channel> {
        self.session()?.create_channel(direction, Some(self))
    }

    /// Create a byte stream established through this channel.
    pub fn create_byte_stream(&self) -> Result<ByteStream> {
        self.session()?.create_byte_stream(Some(self))
    }

    /// Close the channel, or wait for a close already in progress.
    pub async fn close(&self) -> Result<()> {
        self.core.shutdown(false).await
    }

    /// Close the channel without waiting for a close already in progress.
    pub async fn force_close(&self) -> Result<()> {
        self.core.shutdown(true).await
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.core.closed().await
    }

    fn expect(&self, direction: Direction) -> Result<()> {
        if self.direction != direction {
            return Err(ChanError::WrongDirection {
                id: self.id(),
                expected: direction,
            });
        }
        Ok(())
    }

    fn encoder(&self) -> Result<Encoder> {
        Ok(self.session()?.encoder())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}
