//! Deterministic hashing over canonical JSON and raw bytes.
//!
//! Two orchestrator replicas hashing identical inputs must agree bit for bit,
//! so canonical form is fixed:
//! - object keys sorted by UTF-8 bytes
//! - no insignificant whitespace
//! - every string (keys included) NFC-normalized
//! - numbers in `serde_json`'s shortest round-trip form

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::error::HashError;
use crate::plan::PlanArtifactHash;

/// Lowercase hex SHA-256 digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Wrap an already-computed hex digest.
    ///
    /// Fails unless the input is 64 hex characters.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, HashError> {
        let hex = hex.into().to_ascii_lowercase();
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HashError::Encoding(format!(
                "not a sha256 hex digest: {hex}"
            )));
        }
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = HashError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> Self {
        h.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 over raw bytes.
pub fn hash(bytes: &[u8]) -> ContentHash {
    ContentHash(hex::encode(Sha256::digest(bytes)))
}

/// Canonical JSON encoding of any serializable value.
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, HashError> {
    let json = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_canonical(&json, &mut out)?;
    Ok(out)
}

/// Canonicalize raw JSON bytes.
///
/// Fails with [`HashError::Encoding`] on invalid UTF-8 or invalid JSON.
pub fn canonicalize_bytes(raw: &[u8]) -> Result<Vec<u8>, HashError> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| HashError::Encoding(format!("input is not UTF-8: {e}")))?;
    let json: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| HashError::Encoding(format!("input is not JSON: {e}")))?;
    let mut out = Vec::new();
    write_canonical(&json, &mut out)?;
    Ok(out)
}

/// `hash(canonicalize(value))`.
pub fn hash_canonical<T: Serialize + ?Sized>(value: &T) -> Result<ContentHash, HashError> {
    Ok(hash(&canonicalize(value)?))
}

/// Hash an ordered artifact list.
///
/// Each artifact contributes `name`, `hash` and `size` in list order. Strings
/// are length-prefixed and `size` carries a presence byte, so no two distinct
/// lists share a byte stream.
pub fn hash_artifacts(artifacts: &[PlanArtifactHash]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(b"cabincrew-artifacts-v1:");
    hasher.update((artifacts.len() as u64).to_le_bytes());
    for artifact in artifacts {
        update_framed(&mut hasher, artifact.name.nfc().collect::<String>().as_bytes());
        update_framed(&mut hasher, artifact.hash.as_bytes());
        match artifact.size {
            Some(size) => {
                hasher.update([1u8]);
                hasher.update(size.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
    ContentHash(hex::encode(hasher.finalize()))
}

fn update_framed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) -> Result<(), HashError> {
    match value {
        serde_json::Value::Null => out.extend_from_slice(b"null"),
        serde_json::Value::Bool(true) => out.extend_from_slice(b"true"),
        serde_json::Value::Bool(false) => out.extend_from_slice(b"false"),
        serde_json::Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        serde_json::Value::String(s) => write_string(s, out)?,
        serde_json::Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(String, &serde_json::Value)> = map
                .iter()
                .map(|(k, v)| (k.nfc().collect::<String>(), v))
                .collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            for pair in entries.windows(2) {
                if pair[0].0 == pair[1].0 {
                    return Err(HashError::Encoding(format!(
                        "object keys collide after normalization: {}",
                        pair[0].0
                    )));
                }
            }
            out.push(b'{');
            for (i, (key, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out)?;
                out.push(b':');
                write_canonical(val, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

fn write_string(s: &str, out: &mut Vec<u8>) -> Result<(), HashError> {
    let normalized: String = s.nfc().collect();
    let encoded = serde_json::to_string(&normalized)?;
    out.extend_from_slice(encoded.as_bytes());
    Ok(())
}
