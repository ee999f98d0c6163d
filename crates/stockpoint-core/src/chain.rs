//! # Hash Chain
//!
//! Tamper evidence for the persisted Operation Log.
//!
//! ```text
//! GENESIS ──► H(op₁) ──► H(op₂) ──► H(op₃) ──► ... ──► head
//!             prev=G     prev=H₁    prev=H₂
//!
//! H(opₙ) = SHA-256("stockpoint-operation-hash-v1" ‖ prevₙ ‖ fields(opₙ))
//! ```
//!
//! Each record stores its predecessor's hash and its own. Editing, removing
//! or reordering any persisted operation breaks every later link, which
//! replay reports as [`CoreError::ReplayCorruption`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::types::Operation;

/// Hash preceding the first operation of every log.
pub const GENESIS_HASH: &str = "genesis";

const DOMAIN_SEPARATOR: &[u8] = b"stockpoint-operation-hash-v1";
const FIELD_SEPARATOR: &[u8] = &[0x1f];

/// An operation as persisted: payload plus its chain link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainedOperation {
    pub operation: Operation,
    pub prev_hash: String,
    pub record_hash: String,
}

/// Computes the chain hash of `op` following `prev_hash`.
pub fn chain_hash(prev_hash: &str, op: &Operation) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_SEPARATOR);
    hasher.update(prev_hash.as_bytes());

    let token = op.causality_token.to_string();
    let delta = op.delta.to_string();
    let timestamp = op.timestamp_text();
    let fields: [&[u8]; 10] = [
        op.id.as_bytes(),
        op.sku.as_bytes(),
        op.kind.as_str().as_bytes(),
        delta.as_bytes(),
        timestamp.as_bytes(),
        op.actor.as_bytes(),
        op.device_id.as_bytes(),
        token.as_bytes(),
        op.voids.as_deref().unwrap_or_default().as_bytes(),
        op.reason.as_deref().unwrap_or_default().as_bytes(),
    ];
    for field in fields {
        hasher.update(FIELD_SEPARATOR);
        hasher.update(field);
    }

    hex::encode(hasher.finalize())
}

/// Verifies one link and returns the record hash on success.
pub fn verify_link(expected_prev: &str, record: &ChainedOperation) -> CoreResult<String> {
    if record.prev_hash != expected_prev {
        return Err(CoreError::corruption(
            record.operation.id.clone(),
            format!(
                "chain break: expected prev {} but record has {}",
                expected_prev, record.prev_hash
            ),
        ));
    }

    let computed = chain_hash(&record.prev_hash, &record.operation);
    if computed != record.record_hash {
        return Err(CoreError::corruption(
            record.operation.id.clone(),
            "record hash does not match operation contents",
        ));
    }

    Ok(computed)
}

/// Verifies a whole chain from genesis and returns the head hash.
pub fn verify_chain<'a>(records: impl IntoIterator<Item = &'a ChainedOperation>) -> CoreResult<String> {
    records
        .into_iter()
        .try_fold(GENESIS_HASH.to_string(), |prev, record| verify_link(&prev, record))
}
