//! Wire codec for request/reply and publish/subscribe payloads.
//!
//! Every message is a MessagePack map with string keys. Requests carry an
//! `action` field, replies a `status` field; decoders ignore unknown fields
//! so the protocol can grow without breaking older peers.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum size of one encoded message.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Result alias for codec operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors produced by the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// Value could not be serialized.
    #[error("encode failed: {source}")]
    Encode {
        /// Underlying MessagePack encoder error.
        #[from]
        source: rmp_serde::encode::Error,
    },
    /// Payload could not be deserialized.
    #[error("decode failed: {source}")]
    Decode {
        /// Underlying MessagePack decoder error.
        #[from]
        source: rmp_serde::decode::Error,
    },
    /// Message exceeds the size limit.
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge {
        /// Actual encoded size.
        size: usize,
        /// Applicable limit.
        limit: usize,
    },
}

/// Encodes a value as a string-keyed MessagePack map.
///
/// # Errors
///
/// Returns [`WireError::Encode`] on serializer failure and
/// [`WireError::TooLarge`] when the encoded form exceeds
/// [`MAX_MESSAGE_BYTES`].
pub fn encode<T: Serialize>(value: &T) -> WireResult<Vec<u8>> {
    encode_with_limit(value, MAX_MESSAGE_BYTES)
}

/// Encodes a value, enforcing an explicit size limit.
///
/// # Errors
///
/// Returns [`WireError::Encode`] on serializer failure and
/// [`WireError::TooLarge`] when the encoded form exceeds `limit`.
pub fn encode_with_limit<T: Serialize>(value: &T, limit: usize) -> WireResult<Vec<u8>> {
    let bytes = rmp_serde::to_vec_named(value)?;
    if bytes.len() > limit {
        return Err(WireError::TooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok(bytes)
}

/// Decodes a message, ignoring unknown fields.
///
/// # Errors
///
/// Returns [`WireError::TooLarge`] when the raw payload exceeds
/// [`MAX_MESSAGE_BYTES`] and [`WireError::Decode`] when the payload is not a
/// valid encoding of `T`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> WireResult<T> {
    decode_with_limit(bytes, MAX_MESSAGE_BYTES)
}

/// Decodes a message, enforcing an explicit size limit.
///
/// # Errors
///
/// Returns [`WireError::TooLarge`] when the raw payload exceeds `limit` and
/// [`WireError::Decode`] when the payload is not a valid encoding of `T`.
pub fn decode_with_limit<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> WireResult<T> {
    if bytes.len() > limit {
        return Err(WireError::TooLarge {
            size: bytes.len(),
            limit,
        });
    }
    Ok(rmp_serde::from_slice(bytes)?)
}

/// The `{kind, message, context?}` body carried by every error reply.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    /// Machine-readable error kind token, e.g. `not_found`.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional extra context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl ErrorBody {
    /// Creates an error body with no context.
    #[must_use]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            context: BTreeMap::new(),
        }
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Well-known error kind tokens used across fabric protocols.
pub mod fault {
    /// Request action is unknown or malformed.
    pub const BAD_REQUEST: &str = "bad_request";
    /// Named entry does not exist.
    pub const NOT_FOUND: &str = "not_found";
    /// Backend or peer is temporarily unreachable.
    pub const UNAVAILABLE: &str = "unavailable";
    /// Registry entry failed validation.
    pub const INVALID_ENTRY: &str = "invalid_entry";
    /// Two distinct owners claimed the same request endpoint.
    pub const CONFLICT: &str = "conflict";
    /// External store failed.
    pub const BACKEND_ERROR: &str = "backend_error";
    /// Message exceeded the size limit.
    pub const MESSAGE_TOO_LARGE: &str = "message_too_large";
    /// Agent request handler failed.
    pub const HANDLER: &str = "handler";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        probe: String,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct ProbeV2 {
        probe: String,
        deadline_ms: u64,
    }

    #[test]
    fn round_trips_named_maps() {
        let value = Probe {
            probe: "ping".into(),
        };
        let bytes = encode(&value).expect("encode");
        let decoded: Probe = decode(&bytes).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let v2 = ProbeV2 {
            probe: "ping".into(),
            deadline_ms: 250,
        };
        let bytes = encode(&v2).expect("encode");
        let v1: Probe = decode(&bytes).expect("decode v1 view");
        assert_eq!(v1.probe, "ping");
    }

    #[test]
    fn limit_is_inclusive() {
        let value = Probe {
            probe: "ping".into(),
        };
        let bytes = encode(&value).expect("encode");
        assert!(decode_with_limit::<Probe>(&bytes, bytes.len()).is_ok());
        let err = decode_with_limit::<Probe>(&bytes, bytes.len() - 1).expect_err("over limit");
        assert!(matches!(err, WireError::TooLarge { .. }));
    }

    #[test]
    fn oversized_encode_rejected() {
        #[derive(Serialize)]
        struct Big {
            blob: Vec<u8>,
        }
        let big = Big {
            blob: vec![0u8; 64],
        };
        let err = encode_with_limit(&big, 16).expect_err("over limit");
        assert!(matches!(err, WireError::TooLarge { .. }));
    }

    #[test]
    fn error_body_round_trips() {
        let body = ErrorBody::new(fault::NOT_FOUND, "no such agent").with_context("name", "tts");
        let bytes = encode(&body).expect("encode");
        let decoded: ErrorBody = decode(&bytes).expect("decode");
        assert_eq!(decoded, body);
    }
}
