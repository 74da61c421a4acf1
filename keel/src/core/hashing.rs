//! SHA-256 helpers shared by the envelope, approval cache, and logs.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(bytes.as_ref()))
}

/// Hex-encoded SHA-256 of a value's JSON encoding.
///
/// Callers that need a canonical hash must use ordered containers
/// (`BTreeMap`, sorted `Vec`) so the encoding is stable across runs.
pub fn sha256_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_hex(bytes))
}
