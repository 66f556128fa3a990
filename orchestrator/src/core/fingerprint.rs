//! Request fingerprints used to detect replay divergence.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::core::types::EffectKind;

/// SHA-256 (hex) of the canonical JSON of an effect request.
///
/// `serde_json` maps keep keys sorted, so equal requests always hash equally.
pub fn fingerprint(kind: &EffectKind, input: &Value) -> String {
    let canonical = json!({"request": kind, "input": input}).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
