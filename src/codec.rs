use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Weak;
use tracing::trace;

use crate::channel::ext::with_decode_scope;
use crate::error::{ChanError, Result};
use crate::session::SessionShared;

/// Trait for encoding and decoding message payloads
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Encode a serializable value into bytes
    fn encode<T: Serialize + ?Sized>(&self, data: &T) -> Result<Vec<u8>>;

    /// Decode bytes into a deserializable value
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// MessagePack codec. Structs are written as maps with field names so
/// payloads stay readable by other MessagePack implementations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

impl Codec for MessagePackCodec {
    fn encode<T: Serialize + ?Sized>(&self, data: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(data)?)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Value encoder bound to one session.
///
/// Ordinary values go through the codec untouched. [`Channel`] and
/// [`ByteStream`] values may be nested anywhere inside them; on decode they
/// come back as endpoints of the session, already registered with it.
///
/// [`Channel`]: crate::Channel
/// [`ByteStream`]: crate::ByteStream
#[derive(Debug, Clone)]
pub struct Encoder {
    session: Weak<SessionShared>,
    codec: MessagePackCodec,
}

impl Encoder {
    pub(crate) fn new(session: Weak<SessionShared>) -> Self {
        Self {
            session,
            codec: MessagePackCodec,
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        self.codec.encode(value)
    }

    /// Decode a value. Channel references inside it are registered with the
    /// session only if the whole value decodes; protocol errors are also
    /// published as session events.
    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let session = self.session.upgrade().ok_or(ChanError::SessionClosed)?;

        let (decoded, scope) = with_decode_scope(&self.session, || self.codec.decode::<T>(data));
        let result = match decoded {
            Ok(value) => {
                let references = scope.decoded.len();
                session.register_decoded(scope.decoded).map(|()| {
                    if references > 0 {
                        trace!(references, bytes = data.len(), "decoded channel references");
                    }
                    value
                })
            }
            Err(err) => Err(scope.failure.unwrap_or(err)),
        };

        if let Err(err) = &result {
            if err.is_protocol() {
                session.report(err.clone());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde::de::IgnoredAny;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Request {
        id: u64,
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn test_messagepack_codec() {
        let codec = MessagePackCodec;
        let request = Request {
            id: 7,
            name: "ping".into(),
            tags: vec!["a".into()],
        };
        let bytes = codec.encode(&request).unwrap();
        let decoded: Request = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_structs_are_named_maps() {
        let codec = MessagePackCodec;
        let bytes = codec
            .encode(&Request {
                id: 1,
                name: "x".into(),
                tags: vec![],
            })
            .unwrap();
        let as_map: BTreeMap<String, IgnoredAny> = codec.decode(&bytes).unwrap();
        assert_eq!(as_map.len(), 3);
        assert!(as_map.contains_key("name"));
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        let codec = MessagePackCodec;
        let err = codec.decode::<Request>(&[0xc1]).unwrap_err();
        assert!(matches!(err, ChanError::Serialization(_)));
    }
}
