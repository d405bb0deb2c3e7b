//! Content hashing for match detection and change detection.
//!
//! Two structurally equal inputs must always produce the same digest: object
//! keys are serialized in sorted order regardless of insertion order. This is
//! an identity/dedup function, not a security boundary.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash an ordered list of canonical values. Order is significant.
pub fn hash_values(values: &[Value]) -> String {
    let mut buf = String::from("[");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            buf.push(',');
        }
        push_canonical(&mut buf, value);
    }
    buf.push(']');
    digest(&buf)
}

/// Hash a single value, e.g. an opaque native-record identifier.
pub fn hash_value(value: &Value) -> String {
    digest(&canonical_string(value))
}

/// Canonical JSON text for a value: object keys in sorted order. The store
/// uses this as the comparable encoding for opaque native identifiers.
pub fn canonical_string(value: &Value) -> String {
    let mut buf = String::new();
    push_canonical(&mut buf, value);
    buf
}

fn digest(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn push_canonical(buf: &mut String, value: &Value) {
    match value {
        Value::Array(items) => {
            buf.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                push_canonical(buf, item);
            }
            buf.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            buf.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    buf.push(',');
                }
                buf.push_str(&Value::String(key.clone()).to_string());
                buf.push(':');
                push_canonical(buf, &map[key]);
            }
            buf.push('}');
        }
        leaf => buf.push_str(&leaf.to_string()),
    }
}
