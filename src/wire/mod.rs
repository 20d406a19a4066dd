//! Identifiers, stream headers and the byte format of embedded channel
//! references.

pub mod headers;
pub mod types;

use bytes::{Buf, BufMut, BytesMut};

use self::types::{ChannelId, Direction};
use crate::error::{ChanError, Result};

/// MessagePack extension type for channel references.
pub const CHANNEL_EXT: i8 = 0x1;
/// MessagePack extension type for byte stream references.
pub const BYTE_STREAM_EXT: i8 = 0x2;

pub const CHANNEL_REF_SIZE: usize = 1 + 4;
pub const BYTE_STREAM_REF_SIZE: usize = 4;

/// A channel reference as it travels inside a message.
///
/// `direction` is the direction the *receiver* ends up holding: a read
/// channel is sent as a write reference and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRef {
    pub direction: Direction,
    pub id: ChannelId,
}

impl ChannelRef {
    /// Reference to hand the peer for a channel held locally as `local`.
    pub fn for_local(local: Direction, id: ChannelId) -> Self {
        Self {
            direction: local.reversed(),
            id,
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(CHANNEL_REF_SIZE);
        buf.put_u8(self.direction.to_tag());
        buf.put_u32(self.id.raw());
        buf
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        if buf.remaining() != CHANNEL_REF_SIZE {
            return Err(ChanError::MalformedReference {
                expected: CHANNEL_REF_SIZE,
                actual: buf.remaining(),
            });
        }

        let direction = Direction::from_tag(buf.get_u8())?;
        let id = ChannelId(buf.get_u32());
        Ok(Self { direction, id })
    }
}

/// A byte stream reference: just the id, byte streams have no direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteStreamRef {
    pub id: ChannelId,
}

impl ByteStreamRef {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(BYTE_STREAM_REF_SIZE);
        buf.put_u32(self.id.raw());
        buf
    }

    pub fn decode(mut buf: impl Buf) -> Result<Self> {
        if buf.remaining() != BYTE_STREAM_REF_SIZE {
            return Err(ChanError::MalformedReference {
                expected: BYTE_STREAM_REF_SIZE,
                actual: buf.remaining(),
            });
        }
        Ok(Self {
            id: ChannelId(buf.get_u32()),
        })
    }
}
