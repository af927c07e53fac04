//! Canonical encodings used for ledger entries and configuration files.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use simout_core::errors::{ErrorInfo, SimoutError};

fn codec_error(code: &str, err: impl ToString) -> SimoutError {
    SimoutError::Serde(ErrorInfo::new(code, err.to_string()))
}

// Rebuilds every object with keys in byte order, whatever map type
// serde_json was compiled with.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(fields) => {
            let sorted: BTreeMap<String, Value> = fields
                .into_iter()
                .map(|(key, field)| (key, sort_keys(field)))
                .collect();
            Value::Object(sorted.into_iter().collect::<Map<_, _>>())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        scalar => scalar,
    }
}

/// Encodes a value as compact JSON with object keys in sorted order, so
/// struct field order never leaks into the bytes or their digest.
pub fn encode_canonical<T: Serialize>(value: &T) -> Result<Vec<u8>, SimoutError> {
    let tree = serde_json::to_value(value).map_err(|err| codec_error("codec.json_encode", err))?;
    serde_json::to_vec(&sort_keys(tree)).map_err(|err| codec_error("codec.json_write", err))
}

/// Decodes a JSON payload.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SimoutError> {
    serde_json::from_slice(bytes).map_err(|err| codec_error("codec.json_decode", err))
}

/// Encodes a value as YAML.
pub fn encode_yaml<T: Serialize>(value: &T) -> Result<String, SimoutError> {
    serde_yaml::to_string(value).map_err(|err| codec_error("codec.yaml_encode", err))
}

/// Decodes a YAML payload.
pub fn decode_yaml<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SimoutError> {
    serde_yaml::from_slice(bytes).map_err(|err| codec_error("codec.yaml_decode", err))
}

/// Lowercase hex SHA-256 of the canonical JSON encoding.
pub fn digest_hex<T: Serialize>(value: &T) -> Result<String, SimoutError> {
    let bytes = encode_canonical(value)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}
