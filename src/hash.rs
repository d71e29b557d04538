//! Payload hashing over canonical JSON.
//!
//! Change payloads are hashed with SHA-256 over a canonical encoding
//! (lexicographically ordered object keys) so client and server compute the
//! same digest for the same logical payload.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// 32-byte SHA-256 digest.
pub type Hash256 = [u8; 32];

/// Rebuild a JSON value with object keys in lexicographic order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 over the canonical JSON encoding of `payload`.
pub fn canonical_json_hash(payload: &Value) -> Hash256 {
    let canonical = canonicalize(payload);
    let encoded = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&encoded);
    hasher.finalize().into()
}

/// Serde adapter: `Hash256` as a hex string.
pub mod hash256_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes for Hash256"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_hash() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(canonical_json_hash(&a), canonical_json_hash(&b));
    }

    #[test]
    fn different_payloads_differ() {
        let a = json!({"present": true});
        let b = json!({"present": false});
        assert_ne!(canonical_json_hash(&a), canonical_json_hash(&b));
    }
}
