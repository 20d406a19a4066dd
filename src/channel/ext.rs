//! Channels and byte streams as MessagePack extension values.
//!
//! Serializing needs nothing but the id. Deserializing creates a new
//! endpoint, which has to belong to a session: [`Encoder::decode`] installs
//! a thread-local decode scope naming the session and collecting every
//! endpoint created while the value is being decoded.
//!
//! [`Encoder::decode`]: crate::codec::Encoder::decode

use bytes::Bytes;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cell::RefCell;
use std::sync::{Arc, Weak};

use super::endpoint::EndpointCore;
use super::{ByteStream, Channel};
use crate::error::{ChanError, Result};
use crate::session::SessionShared;
use crate::wire::types::EndpointKind;
use crate::wire::{BYTE_STREAM_EXT, ByteStreamRef, CHANNEL_EXT, ChannelRef};

/// rmp-serde maps a newtype struct with this name onto a MessagePack
/// extension value holding `(type, data)`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "_ExtStruct")]
struct ExtStruct((i8, Bytes));

#[derive(Debug)]
pub(crate) struct DecodeScope {
    session: Weak<SessionShared>,
    /// Endpoints created by this decode, in order.
    pub(crate) decoded: Vec<Arc<EndpointCore>>,
    /// First error hit while decoding a reference.
    pub(crate) failure: Option<ChanError>,
}

impl DecodeScope {
    fn new(session: &Weak<SessionShared>) -> Self {
        Self {
            session: session.clone(),
            decoded: Vec::new(),
            failure: None,
        }
    }
}

thread_local! {
    static DECODE_SCOPE: RefCell<Option<DecodeScope>> = const { RefCell::new(None) };
}

/// Puts back the enclosing scope, also when decoding unwinds.
struct RestoreScope(Option<DecodeScope>);

impl Drop for RestoreScope {
    fn drop(&mut self) {
        let previous = self.0.take();
        DECODE_SCOPE.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// Run `decode` with references resolving against `session`.
pub(crate) fn with_decode_scope<R>(
    session: &Weak<SessionShared>,
    decode: impl FnOnce() -> R,
) -> (R, DecodeScope) {
    let previous = DECODE_SCOPE.with(|cell| cell.borrow_mut().replace(DecodeScope::new(session)));
    let _restore = RestoreScope(previous);

    let result = decode();
    let scope = DECODE_SCOPE
        .with(|cell| cell.borrow_mut().take())
        .unwrap_or_else(|| DecodeScope::new(session));
    (result, scope)
}

fn decode_reference(ext_type: i8, data: &[u8], expected: i8) -> Result<Arc<EndpointCore>> {
    DECODE_SCOPE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let scope = slot.as_mut().ok_or(ChanError::NoDecodeScope)?;

        let parsed = if ext_type != expected {
            Err(ChanError::UnknownExtension(ext_type))
        } else if expected == CHANNEL_EXT {
            ChannelRef::decode(data).map(|r| (r.id, EndpointKind::Channel(r.direction)))
        } else {
            ByteStreamRef::decode(data).map(|r| (r.id, EndpointKind::ByteStream))
        };

        match parsed {
            Ok((id, kind)) => {
                let core = EndpointCore::new(id, kind, scope.session.clone());
                scope.decoded.push(core.clone());
                Ok(core)
            }
            Err(err) => {
                scope.failure.get_or_insert_with(|| err.clone());
                Err(err)
            }
        }
    })
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let reference = ChannelRef::for_local(self.direction(), self.id());
        ExtStruct((CHANNEL_EXT, reference.encode().freeze())).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let ExtStruct((ext_type, data)) = ExtStruct::deserialize(deserializer)?;
        let core = decode_reference(ext_type, &data, CHANNEL_EXT).map_err(D::Error::custom)?;
        match core.kind() {
            EndpointKind::Channel(direction) => Ok(Channel::from_core(core, direction)),
            EndpointKind::ByteStream => Err(D::Error::custom(ChanError::UnknownExtension(ext_type))),
        }
    }
}

impl Serialize for ByteStream {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let reference = ByteStreamRef { id: self.id() };
        ExtStruct((BYTE_STREAM_EXT, reference.encode().freeze())).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ByteStream {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let ExtStruct((ext_type, data)) = ExtStruct::deserialize(deserializer)?;
        let core = decode_reference(ext_type, &data, BYTE_STREAM_EXT).map_err(D::Error::custom)?;
        Ok(ByteStream::from_core(core))
    }
}
