//! Deterministic byte serialization of unsigned envelopes. The canonical form
//! is JSON with object keys ascending by code point, integers in minimal
//! decimal, and no insignificant whitespace. Two semantically equal envelopes
//! encode to byte-identical output, so the SHA-256 of the encoding serves as
//! a stable identifier (`rfq_id`, `quote_id`, `terms_hash`).

use serde_json::Value;
use sha2::{Digest as _, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CanonicalError {
    /// Floating-point numbers have no canonical decimal form and are
    /// forbidden everywhere in envelope bodies.
    #[error("floating-point values are not canonically encodable")]
    FloatForbidden,
    #[error("serialize: {0}")]
    Serialize(String),
}

/// Encodes a JSON value into its canonical byte form.
pub fn encode_canonical(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    let mut out = Vec::new();
    write_value(&mut out, value)?;
    Ok(out)
}

/// Lowercase hex SHA-256 over the canonical encoding.
pub fn hash_canonical(value: &Value) -> Result<String, CanonicalError> {
    let bytes = encode_canonical(value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn write_value(out: &mut Vec<u8>, value: &Value) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => {
            if n.is_f64() {
                return Err(CanonicalError::FloatForbidden);
            }
            out.extend_from_slice(n.to_string().as_bytes());
        }
        Value::String(s) => {
            let escaped = serde_json::to_string(s)
                .map_err(|e| CanonicalError::Serialize(e.to_string()))?;
            out.extend_from_slice(escaped.as_bytes());
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // Sort explicitly; byte-wise String ordering equals code-point
            // ordering for UTF-8.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                let escaped = serde_json::to_string(key)
                    .map_err(|e| CanonicalError::Serialize(e.to_string()))?;
                out.extend_from_slice(escaped.as_bytes());
                out.push(b':');
                write_value(out, &map[key])?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_whitespace_free() {
        let v = json!({"b": 1, "a": {"z": "x", "y": [1, 2]}});
        let bytes = encode_canonical(&v).unwrap();
        assert_eq!(bytes, br#"{"a":{"y":[1,2],"z":"x"},"b":1}"#);
    }

    #[test]
    fn equal_values_hash_identically() {
        let a = json!({"v": 1, "kind": "RFQ", "trade_id": "t1", "body": {"btc_sats": 50000}});
        let b: Value =
            serde_json::from_slice(&encode_canonical(&a).unwrap()).unwrap();
        assert_eq!(hash_canonical(&a).unwrap(), hash_canonical(&b).unwrap());
    }

    #[test]
    fn floats_are_rejected() {
        let v = json!({"amount": 0.5});
        assert_eq!(encode_canonical(&v), Err(CanonicalError::FloatForbidden));
    }

    #[test]
    fn integers_render_minimal_decimal() {
        let v = json!({"n": 18446744073709551615u64, "m": -7});
        let bytes = encode_canonical(&v).unwrap();
        assert_eq!(bytes, br#"{"m":-7,"n":18446744073709551615}"#);
    }
}
