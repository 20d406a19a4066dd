use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{ChanError, Result};

/// Stride between two ids allocated by the same side of a session.
pub const ID_STRIDE: u32 = 2;

/// Reserved id meaning "no parent" in stream headers. Never allocated.
pub const ROOT_ID: ChannelId = ChannelId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u32);

impl ChannelId {
    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_root(&self) -> bool {
        *self == ROOT_ID
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a message channel, as seen by the side holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Direction {
    /// Consumer-facing: reads messages written by the peer.
    Read = 0x1,
    /// Producer-facing: writes messages the peer reads.
    Write = 0x2,
}

impl Direction {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0x1 => Ok(Direction::Read),
            0x2 => Ok(Direction::Write),
            _ => Err(ChanError::UnknownDirection(tag)),
        }
    }

    pub fn to_tag(self) -> u8 {
        self as u8
    }

    /// The direction the peer ends up holding for the same channel.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// What kind of endpoint an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Channel(Direction),
    ByteStream,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Channel(direction) => write!(f, "{} channel", direction),
            EndpointKind::ByteStream => f.write_str("byte stream"),
        }
    }
}

/// Which residue class of the id space this side of a session owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Accepting side: even ids 2, 4, 6, ...
    #[default]
    Acceptor,
    /// Connecting side: odd ids 1, 3, 5, ...
    Initiator,
}

/// Hands out channel ids for one side of a session.
#[derive(Debug)]
pub struct ChannelIdAllocator {
    next: AtomicU32,
}

impl ChannelIdAllocator {
    pub fn new(role: Role) -> Self {
        let start = match role {
            Role::Acceptor => 2,
            Role::Initiator => 1,
        };
        Self {
            next: AtomicU32::new(start),
        }
    }

    /// Allocate the next id. Ids are never handed out twice.
    pub fn next(&self) -> Result<ChannelId> {
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                id.checked_add(ID_STRIDE)
            })
            .map(ChannelId)
            .map_err(|_| ChanError::IdsExhausted)
    }

    /// Whether `id` belongs to this allocator's residue class.
    pub fn owns(&self, id: ChannelId) -> bool {
        let start = self.next.load(Ordering::Relaxed);
        id.0 % ID_STRIDE == start % ID_STRIDE
    }
}
