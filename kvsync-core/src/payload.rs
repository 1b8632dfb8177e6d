//! JSON payload codec shared by the local and remote adapters.
//!
//! Payloads are opaque to the cache: it only ever moves whole JSON
//! documents between memory, the local store and the remote store.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// Serialize a typed value into a JSON document.
pub fn to_document<T: Serialize>(key: &str, value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(|e| CodecError::Serialize {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Deserialize a JSON document into a typed value.
pub fn from_document<T: DeserializeOwned>(key: &str, document: &Value) -> Result<T, CodecError> {
    T::deserialize(document).map_err(|e| CodecError::Deserialize {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Encode a document into the string form kept by the local store.
pub fn encode(key: &str, document: &Value) -> Result<String, CodecError> {
    serde_json::to_string(document).map_err(|e| CodecError::Serialize {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decode the string form kept by the local store.
pub fn decode(key: &str, raw: &str) -> Result<Value, CodecError> {
    serde_json::from_str(raw).map_err(|e| CodecError::Deserialize {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Decode a stored record, treating corruption as absence.
///
/// Corrupted cache state must never take the application down; the record
/// is reported and ignored so the next successful refresh can repair it.
pub fn decode_or_absent(key: &str, raw: Option<&str>) -> Option<Value> {
    let raw = raw?;
    match decode(key, raw) {
        Ok(document) => Some(document),
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Discarding undecodable stored payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: String,
        age: u32,
    }

    #[test]
    fn test_typed_document_conversion() {
        let profile = Profile {
            id: "p1".to_string(),
            age: 29,
        };
        let document = to_document("profiles", &profile).expect("serialize should succeed");
        assert_eq!(document, json!({"id": "p1", "age": 29}));

        let back: Profile = from_document("profiles", &document).expect("deserialize should succeed");
        assert_eq!(back, profile);
    }

    #[test]
    fn test_schema_mismatch_is_codec_error() {
        let document = json!({"id": 7});
        let err = from_document::<Profile>("profiles", &document).expect_err("should fail");
        assert!(matches!(err, CodecError::Deserialize { ref key, .. } if key == "profiles"));
    }

    #[test]
    fn test_decode_or_absent_recovers_from_corruption() {
        assert_eq!(decode_or_absent("k", None), None);
        assert_eq!(decode_or_absent("k", Some("{not json")), None);
        assert_eq!(decode_or_absent("k", Some("[1,2]")), Some(json!([1, 2])));
    }

    #[test]
    fn test_encode_is_compact_json() {
        let raw = encode("k", &json!({"a": [1, 2]})).expect("encode should succeed");
        assert_eq!(raw, r#"{"a":[1,2]}"#);
    }
}
