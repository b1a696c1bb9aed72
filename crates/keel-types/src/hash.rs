//! Canonical JSON and BLAKE3 content hashing.
//!
//! Two payloads that differ only in key order or numeric rendering must hash
//! identically, so every hash in the kernel goes through `canonical_json`
//! first: object keys sorted, numbers rewritten as normalized decimal
//! strings, arrays kept in order.

use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Rewrite a JSON value into its canonical form.
pub fn canonical_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            // serde_json's default map is sorted; re-insertion keeps it so.
            let mut canonical = serde_json::Map::new();
            for (key, inner) in map {
                canonical.insert(key.clone(), canonical_json(inner));
            }
            Value::Object(canonical)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical_json).collect()),
        Value::Number(number) => Value::String(normalize_number(&number.to_string())),
        other => other.clone(),
    }
}

fn normalize_number(raw: &str) -> String {
    match Decimal::from_str(raw) {
        Ok(decimal) => decimal.normalize().to_string(),
        // Out-of-range numbers keep their literal rendering.
        Err(_) => raw.to_string(),
    }
}

/// BLAKE3 hex digest of arbitrary bytes.
pub fn hash_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// BLAKE3 hex digest of a JSON value in canonical form.
pub fn hash_canonical(value: &Value) -> String {
    let canonical = canonical_json(value);
    let serialized = serde_json::to_vec(&canonical).unwrap_or_default();
    hash_hex(&serialized)
}

/// Audit-chain hash: H(payload_hash || prev_hash || seq || action).
pub fn chain_hash(payload_hash: &str, prev_hash: Option<&str>, seq: u64, action: &str) -> String {
    let material = format!(
        "{payload_hash}|{prev}|{seq}|{action}",
        prev = prev_hash.unwrap_or("genesis")
    );
    hash_hex(material.as_bytes())
}
