//! Deterministic contract hashing.
//!
//! Structural fields participate in hashes; advisory/meta fields are
//! excluded. Serialization is canonical: sorted keys, no whitespace.
//! Hashes are SHA-256 truncated to 16 hex chars (64-bit short hash).

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of a truncated contract hash in hex characters.
pub const SHORT_HASH_LEN: usize = 16;

/// Fields excluded from structural hashing (advisory / meta / visual / runtime).
pub const EXCLUDED_FIELDS: &[&str] = &[
    "contract_version",
    "contract_hash",
    "parent_contract_hash",
    "execution_hash",
    "l2_generate_prompt",
    "region_name",
    "gm_guidance",
    "assigned_color",
    "existing_track_id",
];

/// Errors raised while canonicalising a contract for hashing.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("contract serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("expected a JSON object at the contract root, got {0}")]
    NotAnObject(&'static str),
}

/// SHA-256 over `bytes`, truncated to [`SHORT_HASH_LEN`] hex chars.
pub fn short_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(SHORT_HASH_LEN);
    hex
}

fn strip_advisory(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !EXCLUDED_FIELDS.contains(&k.as_str()));
            for v in map.values_mut() {
                strip_advisory(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_advisory(v);
            }
        }
        _ => {}
    }
}

/// Convert a contract to its canonical JSON value for hashing.
///
/// Advisory fields are removed recursively. Key ordering is handled by
/// `serde_json`'s sorted object maps, so serialising the returned value
/// yields deterministic bytes.
pub fn canonical_value<T: Serialize>(contract: &T) -> Result<Value, HashError> {
    let mut value = serde_json::to_value(contract)?;
    if !value.is_object() {
        return Err(HashError::NotAnObject(json_type_name(&value)));
    }
    strip_advisory(&mut value);
    Ok(value)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Hash an already-canonicalised value (sorted keys, compact separators).
pub fn hash_canonical(value: &Value) -> String {
    short_hash(value.to_string().as_bytes())
}

/// Compute the structural hash of a contract.
pub fn compute_contract_hash<T: Serialize>(contract: &T) -> Result<String, HashError> {
    Ok(hash_canonical(&canonical_value(contract)?))
}

/// Collision-proof aggregate hash over a list of child hashes.
///
/// Sorts lexicographically and JSON-encodes the sorted list before
/// hashing, so no delimiter inside a token can forge a collision the way
/// plain `A + ":" + B` concatenation could.
pub fn hash_list(children: &[String]) -> String {
    let mut sorted = children.to_vec();
    sorted.sort();
    let encoded = Value::Array(sorted.into_iter().map(Value::String).collect()).to_string();
    short_hash(encoded.as_bytes())
}

/// Bind an execution to a specific contract and session.
///
/// The same contract run under two trace ids yields two distinct
/// execution hashes, which is the replay defence.
pub fn execution_hash(contract_hash: &str, trace_id: &str) -> String {
    let mut payload = String::with_capacity(contract_hash.len() + trace_id.len());
    payload.push_str(contract_hash);
    payload.push_str(trace_id);
    short_hash(payload.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Fixture {
        name: String,
        index: u32,
        contract_hash: String,
        l2_generate_prompt: String,
    }

    fn fixture(prompt: &str, hash: &str) -> Fixture {
        Fixture {
            name: "verse".into(),
            index: 1,
            contract_hash: hash.into(),
            l2_generate_prompt: prompt.into(),
        }
    }

    #[test]
    fn test_short_hash_is_16_hex_chars() {
        let h = short_hash(b"payload");
        assert_eq!(h.len(), SHORT_HASH_LEN);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let a = compute_contract_hash(&fixture("", "")).unwrap();
        let b = compute_contract_hash(&fixture("", "")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_advisory_fields_do_not_affect_hash() {
        let a = compute_contract_hash(&fixture("", "")).unwrap();
        let b = compute_contract_hash(&fixture("louder drums", "deadbeefdeadbeef")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_structural_fields_do_affect_hash() {
        let a = compute_contract_hash(&fixture("", "")).unwrap();
        let mut other = fixture("", "");
        other.index = 2;
        let b = compute_contract_hash(&other).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_canonicalisation_is_idempotent() {
        let once = canonical_value(&fixture("advice", "")).unwrap();
        let twice = canonical_value(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(hash_canonical(&once), hash_canonical(&twice));
    }

    #[test]
    fn test_hash_list_is_order_independent() {
        let a = vec!["bbb".to_string(), "aaa".to_string(), "ccc".to_string()];
        let b = vec!["ccc".to_string(), "aaa".to_string(), "bbb".to_string()];
        assert_eq!(hash_list(&a), hash_list(&b));
    }

    #[test]
    fn test_hash_list_resists_delimiter_collisions() {
        let a = hash_list(&["ab".to_string(), "c".to_string()]);
        let b = hash_list(&["a".to_string(), "bc".to_string()]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_execution_hash_varies_with_trace() {
        let h = "0123456789abcdef";
        assert_ne!(execution_hash(h, "trace-a"), execution_hash(h, "trace-b"));
        assert_eq!(execution_hash(h, "trace-a"), execution_hash(h, "trace-a"));
    }

    #[test]
    fn test_non_object_root_is_rejected() {
        let result = canonical_value(&vec![1, 2, 3]);
        assert!(matches!(result, Err(HashError::NotAnObject("array"))));
    }
}
