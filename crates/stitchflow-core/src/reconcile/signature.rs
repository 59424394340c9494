//! Canonical-string HMAC-SHA256 signing for completion callbacks.
//!
//! The canonical string is built from the callback's wire-format keys minus
//! `signature`, sorted, rendered `key=value` and joined with `&`. There is
//! no auth header on the callback endpoint: trust derives solely from this
//! signature, verified in constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;

use stitchflow_types::callback::StepCallback;
use stitchflow_types::error::NodeError;

type HmacSha256 = Hmac<Sha256>;

/// Build the canonical payload string for signing.
///
/// Keys are the camelCase wire names, sorted lexicographically. Absent
/// optional fields are omitted entirely. String values render verbatim;
/// everything else renders as compact JSON.
pub fn canonical_string(callback: &StepCallback) -> String {
    let mut pairs: BTreeMap<&'static str, String> = BTreeMap::new();
    pairs.insert("taskId", callback.task_id.to_string());
    pairs.insert("stepIndex", callback.step_index.to_string());
    pairs.insert("status", callback.status.as_str().to_string());
    pairs.insert("timestamp", callback.timestamp.to_string());
    if let Some(output) = &callback.output {
        let rendered = match output {
            serde_json::Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        pairs.insert("output", rendered);
    }
    if let Some(message) = &callback.error_message {
        pairs.insert("errorMessage", message.clone());
    }
    pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compute the hex signature for a callback (worker side, and test vectors).
pub fn sign_callback(secret: &[u8], callback: &StepCallback) -> Result<String, NodeError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| NodeError::internal(format!("invalid HMAC key: {e}")))?;
    mac.update(canonical_string(callback).as_bytes());
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

/// Verify a callback's signature. Constant-time comparison via the `hmac`
/// crate's `verify_slice`.
pub fn verify_callback(secret: &[u8], callback: &StepCallback) -> Result<(), NodeError> {
    let expected = hex_decode(&callback.signature)
        .map_err(|_| NodeError::new(stitchflow_types::error::ErrorKind::SignatureInvalid, "malformed signature hex"))?;
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| NodeError::internal(format!("invalid HMAC key: {e}")))?;
    mac.update(canonical_string(callback).as_bytes());
    mac.verify_slice(&expected).map_err(|_| {
        NodeError::new(
            stitchflow_types::error::ErrorKind::SignatureInvalid,
            "signature mismatch",
        )
    })
}

/// Decode a hex string to bytes.
fn hex_decode(hex: &str) -> Result<Vec<u8>, ()> {
    if hex.len() % 2 != 0 {
        return Err(());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

/// Encode bytes to a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
