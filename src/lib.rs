//! chanpass - channel passing over multiplexed connections
//!
//! Channels are values: a [`Channel`] or [`ByteStream`] can be embedded in
//! any message sent over another channel, and the receiving [`Session`]
//! turns the reference back into a live endpoint once the matching
//! transport stream shows up.
pub mod channel;
pub mod codec;
pub mod error;
pub mod session;
pub mod transport;
pub mod wire;

pub use channel::{ByteStream, Channel, ChannelState};
pub use codec::{Codec, Encoder, MessagePackCodec};
pub use error::{ChanError, Result, TransportError, TransportResult};
pub use session::{Session, SessionConfig, SessionEvent, SessionState};
pub use transport::memory::{MemoryConfig, MemoryConnection, MemoryStream, session_pair};
pub use transport::{Connection, FrameStream, InboundStream, TransportStats};
pub use wire::headers::StreamHeaders;
pub use wire::types::{ChannelId, Direction, EndpointKind, Role};
