//! Payload codecs
//!
//! State and output payloads cross the engine as opaque bytes; these codecs
//! are the only place the typed world meets the byte world.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MediatorError, MediatorResult};

/// Two-way codec between a payload type and its byte representation.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> MediatorResult<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> MediatorResult<T>;
}

/// Compact binary codec; the default for persisted state.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> MediatorResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| MediatorError::Serialization {
            details: format!("bincode encode: {e}"),
        })
    }

    fn decode(&self, bytes: &[u8]) -> MediatorResult<T> {
        bincode::deserialize(bytes).map_err(|e| MediatorError::Serialization {
            details: format!("bincode decode: {e}"),
        })
    }
}

/// JSON codec for payloads that must stay readable on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> MediatorResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| MediatorError::Serialization {
            details: format!("json encode: {e}"),
        })
    }

    fn decode(&self, bytes: &[u8]) -> MediatorResult<T> {
        serde_json::from_slice(bytes).map_err(|e| MediatorError::Serialization {
            details: format!("json decode: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u32,
        tag: String,
    }

    #[test]
    fn bincode_round_trip() {
        let codec = BincodeCodec;
        let value = Sample {
            id: 7,
            tag: "x".into(),
        };
        let bytes = codec.encode(&value).unwrap();
        let decoded: Sample = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn json_decode_failure_is_a_serialization_error() {
        let codec = JsonCodec;
        let err = <JsonCodec as Codec<Sample>>::decode(&codec, b"not json").unwrap_err();
        assert!(matches!(err, MediatorError::Serialization { .. }));
    }
}
