use thiserror::Error;

use crate::wire::types::{ChannelId, Direction};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChanError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown channel direction tag: {0:#04x}")]
    UnknownDirection(u8),

    #[error("Unknown extension type: {0}")]
    UnknownExtension(i8),

    #[error("Malformed channel reference: expected {expected} bytes, got {actual}")]
    MalformedReference { expected: usize, actual: usize },

    #[error("Channel {0} is already registered")]
    DuplicateChannel(ChannelId),

    #[error("Channel {0} is already bound")]
    AlreadyBound(ChannelId),

    #[error("Channel id {0} was already used in this session")]
    ReusedId(ChannelId),

    #[error("Peer used channel id {0} from the local id space")]
    IdOutOfRange(ChannelId),

    #[error("Unknown parent channel {parent} for channel {id}")]
    UnknownParent { id: ChannelId, parent: ChannelId },

    #[error("Missing or invalid stream header {name}: {value:?}")]
    InvalidHeader { name: String, value: Option<String> },

    #[error("Channel reference decoded outside of a session")]
    NoDecodeScope,

    #[error("Channel {id} is not a {expected} channel")]
    WrongDirection { id: ChannelId, expected: Direction },

    #[error("Channel {0} belongs to another session")]
    ForeignChannel(ChannelId),

    #[error("Channel {0} is closed")]
    ChannelClosed(ChannelId),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Channel id space exhausted")]
    IdsExhausted,

    #[error("Failed to close channel {id}: {reason}")]
    CloseFailed { id: ChannelId, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ChanError {
    /// Whether the error is a peer protocol violation rather than a local
    /// or transport failure.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ChanError::UnknownDirection(_)
                | ChanError::UnknownExtension(_)
                | ChanError::MalformedReference { .. }
                | ChanError::DuplicateChannel(_)
                | ChanError::AlreadyBound(_)
                | ChanError::ReusedId(_)
                | ChanError::IdOutOfRange(_)
                | ChanError::UnknownParent { .. }
                | ChanError::InvalidHeader { .. }
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Send failed after {attempts} attempts: {reason}")]
    SendFailed { attempts: u32, reason: String },

    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout { duration_ms: u64, operation: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Stream closed")]
    Closed,

    #[error("Push not supported by {0}")]
    PushUnsupported(String),

    #[error("Push failed: {0}")]
    PushFailed(String),
}

pub type Result<T> = std::result::Result<T, ChanError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<rmp_serde::encode::Error> for ChanError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ChanError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ChanError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ChanError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_classification() {
        assert!(ChanError::UnknownDirection(3).is_protocol());
        assert!(ChanError::DuplicateChannel(ChannelId(4)).is_protocol());
        assert!(!ChanError::SessionClosed.is_protocol());
        assert!(!ChanError::Transport(TransportError::PushFailed("x".into())).is_protocol());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ChanError::UnknownDirection(3).to_string(),
            "Unknown channel direction tag: 0x03"
        );
        assert_eq!(
            ChanError::WrongDirection {
                id: ChannelId(6),
                expected: Direction::Write
            }
            .to_string(),
            "Channel 6 is not a write channel"
        );
    }
}
