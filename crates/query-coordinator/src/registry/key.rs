use std::fmt;

use base64::{display::Base64Display, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Map, Value};

use crate::document::OperationRequest;

/// Identity of a logical operation: document fingerprint, canonical variables and
/// the optional deduplication context. Two requests with equal keys may share one
/// transport subscription.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct OperationKey(String);

impl OperationKey {
    pub fn new(request: &OperationRequest, dedup_context: Option<&str>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(request.document.fingerprint().as_bytes());
        hasher.update(&[0x00]);
        hash_object(&mut hasher, &request.variables);
        hasher.update(&[0x00]);
        if let Some(context) = dedup_context {
            hasher.update(&(context.len() as u64).to_le_bytes());
            hasher.update(context.as_bytes());
        }
        let hash = hasher.finalize();

        OperationKey(format!(
            "op.blake3.{}",
            Base64Display::new(hash.as_bytes(), &URL_SAFE_NO_PAD)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Variables are hashed with object keys sorted, so `{a, b}` and `{b, a}` are the
// same operation even though the maps keep insertion order.
fn hash_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"n");
        }
        Value::Bool(b) => {
            hasher.update(if *b { b"t" } else { b"f" });
        }
        Value::Number(number) => {
            hasher.update(b"#");
            hasher.update(number.to_string().as_bytes());
            hasher.update(&[0x00]);
        }
        Value::String(string) => {
            hasher.update(b"s");
            hasher.update(&(string.len() as u64).to_le_bytes());
            hasher.update(string.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => hash_object(hasher, map),
    }
}

fn hash_object(hasher: &mut blake3::Hasher, map: &Map<String, Value>) {
    let mut entries = map.iter().collect::<Vec<_>>();
    entries.sort_unstable_by(|(left, _), (right, _)| left.cmp(right));

    hasher.update(b"{");
    hasher.update(&(entries.len() as u64).to_le_bytes());
    for (key, value) in entries {
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hash_value(hasher, value);
    }
}
