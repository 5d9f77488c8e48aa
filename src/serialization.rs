//! Content-type keyed serialization registry (spec.md §4.1).
//!
//! Mirrors `twoost/amqp.py`'s `MESSAGE_SERIALIZERS` dict: a lookup from
//! lower-cased content-type to an encode/decode pair, identity by default.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// The process-wide (or per-caller) registry of content-type codecs.
///
/// Construction is cheap and registries are normally shared behind an `Arc`;
/// this mirrors spec.md §9's "Global mutable state: none required beyond
/// process-wide serializer registry, which is initialised once and read-only
/// thereafter" — we just don't force it into a single global, so tests can
/// build independent registries.
#[derive(Clone)]
pub struct SerializationRegistry {
    json_aliases: Arc<[String]>,
    #[cfg(feature = "msgpack")]
    msgpack_aliases: Arc<[String]>,
    #[cfg(feature = "bincode-codec")]
    bincode_aliases: Arc<[String]>,
}

impl Default for SerializationRegistry {
    fn default() -> Self {
        Self {
            json_aliases: Arc::from(vec!["application/json".to_string(), "json".to_string()]),
            #[cfg(feature = "msgpack")]
            msgpack_aliases: Arc::from(vec![
                "application/x-msgpack".to_string(),
                "application/msgpack".to_string(),
                "msgpack".to_string(),
            ]),
            #[cfg(feature = "bincode-codec")]
            bincode_aliases: Arc::from(vec!["application/bincode".to_string()]),
        }
    }
}

/// Content-type classification used by `encode`/`decode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Identity,
    Json,
    #[cfg(feature = "msgpack")]
    Msgpack,
    #[cfg(feature = "bincode-codec")]
    Bincode,
}

impl SerializationRegistry {
    fn classify(&self, content_type: &str) -> Result<Kind> {
        let ct = content_type.to_lowercase();
        if ct.is_empty() || ct == "application/octet-stream" {
            return Ok(Kind::Identity);
        }
        if self.json_aliases.iter().any(|a| a == &ct) {
            return Ok(Kind::Json);
        }
        #[cfg(feature = "msgpack")]
        if self.msgpack_aliases.iter().any(|a| a == &ct) {
            return Ok(Kind::Msgpack);
        }
        #[cfg(feature = "bincode-codec")]
        if self.bincode_aliases.iter().any(|a| a == &ct) {
            return Ok(Kind::Bincode);
        }
        Err(Error::UnknownContentType(content_type.to_string()))
    }

    /// Encode `value` for `content_type`. An empty content-type is treated as
    /// identity (raw bytes expected to already be encoded by the caller is
    /// not representable generically here; use `encode_bytes` for that case).
    pub fn encode<T: Serialize>(&self, value: &T, content_type: &str) -> Result<Vec<u8>> {
        match self.classify(content_type)? {
            Kind::Identity => {
                serde_json::to_vec(value).map_err(|e| Error::SerializationError(e.to_string()))
            }
            Kind::Json => {
                serde_json::to_vec(value).map_err(|e| Error::SerializationError(e.to_string()))
            }
            #[cfg(feature = "msgpack")]
            Kind::Msgpack => {
                rmp_serde::to_vec(value).map_err(|e| Error::SerializationError(e.to_string()))
            }
            #[cfg(feature = "bincode-codec")]
            Kind::Bincode => {
                bincode::serialize(value).map_err(|e| Error::SerializationError(e.to_string()))
            }
        }
    }

    /// Decode `bytes` for `content_type` into `T`.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8], content_type: &str) -> Result<T> {
        match self.classify(content_type)? {
            Kind::Identity | Kind::Json => {
                serde_json::from_slice(bytes).map_err(|e| Error::SerializationError(e.to_string()))
            }
            #[cfg(feature = "msgpack")]
            Kind::Msgpack => {
                rmp_serde::from_slice(bytes).map_err(|e| Error::SerializationError(e.to_string()))
            }
            #[cfg(feature = "bincode-codec")]
            Kind::Bincode => {
                bincode::deserialize(bytes).map_err(|e| Error::SerializationError(e.to_string()))
            }
        }
    }

    /// Encode raw bytes with no content-type transformation (identity path
    /// used when the caller has already serialized the body themselves).
    pub fn encode_raw(&self, bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    /// Whether `content_type` is registered at all.
    pub fn is_known(&self, content_type: &str) -> bool {
        self.classify(content_type).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn identity_and_empty_content_type_both_use_json_wire_form() {
        let reg = SerializationRegistry::default();
        let sample = Sample { a: 1, b: "x".into() };
        let encoded = reg.encode(&sample, "").unwrap();
        let decoded: Sample = reg.decode(&encoded, "application/octet-stream").unwrap();
        assert_eq!(sample, decoded);
    }

    #[test]
    fn json_round_trip_for_both_aliases() {
        let reg = SerializationRegistry::default();
        let sample = Sample { a: 42, b: "hello".into() };
        for ct in ["application/json", "json", "APPLICATION/JSON"] {
            let encoded = reg.encode(&sample, ct).unwrap();
            let decoded: Sample = reg.decode(&encoded, ct).unwrap();
            assert_eq!(sample, decoded);
        }
    }

    #[test]
    fn unknown_content_type_fails() {
        let reg = SerializationRegistry::default();
        let err = reg.decode::<Sample>(b"{}", "application/x-not-a-thing").unwrap_err();
        assert!(matches!(err, Error::UnknownContentType(_)));
    }

    #[test]
    fn malformed_json_fails_with_serialization_error() {
        let reg = SerializationRegistry::default();
        let err = reg.decode::<Sample>(b"not json", "application/json").unwrap_err();
        assert!(matches!(err, Error::SerializationError(_)));
    }

    #[cfg(feature = "msgpack")]
    #[test]
    fn msgpack_round_trip() {
        let reg = SerializationRegistry::default();
        let sample = Sample { a: 7, b: "mp".into() };
        let encoded = reg.encode(&sample, "application/x-msgpack").unwrap();
        let decoded: Sample = reg.decode(&encoded, "msgpack").unwrap();
        assert_eq!(sample, decoded);
    }
}
