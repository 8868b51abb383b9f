//! Request fingerprinting
//!
//! A fingerprint identifies the body of a request so that an idempotency key
//! reused with different content can be rejected instead of replaying an
//! unrelated result.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of `value` rendered as canonical JSON
///
/// Object keys are sorted at every depth, so two payloads that differ only
/// in key order produce the same fingerprint.
///
/// # Examples
///
/// ```
/// use genguard_core::fingerprint_json;
/// use serde_json::json;
///
/// let a = fingerprint_json(&json!({"prompt": "hi", "max_tokens": 64})).unwrap();
/// let b = fingerprint_json(&json!({"max_tokens": 64, "prompt": "hi"})).unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.len(), 64);
/// ```
pub fn fingerprint_json<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    let value = serde_json::to_value(value)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

fn write_canonical(value: &Value, out: &mut String) -> serde_json::Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde::Serialize;
    use serde_json::json;

    use super::*;

    #[derive(Serialize)]
    struct GenerateRequest<'a> {
        prompt: &'a str,
        max_tokens: u32,
    }

    #[test]
    fn nested_key_order_does_not_matter() {
        let a = json!({"outer": {"b": 1, "a": [{"y": true, "x": null}]}, "z": "s"});
        let b = json!({"z": "s", "outer": {"a": [{"x": null, "y": true}], "b": 1}});
        assert_eq!(fingerprint_json(&a).unwrap(), fingerprint_json(&b).unwrap());
    }

    #[test]
    fn different_bodies_differ() {
        let a = GenerateRequest { prompt: "hello", max_tokens: 64 };
        let b = GenerateRequest { prompt: "hello", max_tokens: 65 };
        assert_ne!(fingerprint_json(&a).unwrap(), fingerprint_json(&b).unwrap());
    }

    #[test]
    fn array_order_matters() {
        assert_ne!(
            fingerprint_json(&json!([1, 2])).unwrap(),
            fingerprint_json(&json!([2, 1])).unwrap()
        );
    }

    #[test]
    fn digest_is_sha256_of_canonical_text() {
        let expected = hex::encode(Sha256::digest(br#"{"a":1,"b":"x"}"#));
        assert_eq!(fingerprint_json(&json!({"b": "x", "a": 1})).unwrap(), expected);
    }
}
