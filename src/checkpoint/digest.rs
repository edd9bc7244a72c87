//! Stable configuration digest
//!
//! SHA-256 over a canonical JSON rendering (object keys sorted at every
//! level), so field order never changes the digest.

use super::CheckpointError;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize(value));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Hex SHA-256 of the canonical JSON form of `config`
pub fn config_digest<T: Serialize + ?Sized>(config: &T) -> Result<String, CheckpointError> {
    let value =
        serde_json::to_value(config).map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    let canonical = serde_json::to_string(&canonicalize(value))
        .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}
