//! Channels and byte streams: the endpoints applications pass around.

pub mod byte_stream;
pub(crate) mod endpoint;
pub(crate) mod ext;
pub mod message;

pub use byte_stream::ByteStream;
pub use endpoint::ChannelState;
pub use message::Channel;
