//! Blake3 hashing and hash-chain primitives.

use serde::Serialize;
use thiserror::Error;

/// Size of a Blake3 hash in bytes.
pub const HASH_SIZE: usize = 32;

/// Type alias for a 32-byte hash.
pub type Hash = [u8; HASH_SIZE];

/// Errors that can occur during hash chain operations.
#[derive(Debug, Error)]
pub enum HashChainError {
    /// The previous hash doesn't match the expected value.
    #[error("hash chain broken: expected {expected}, got {actual}")]
    ChainBroken {
        /// The expected previous hash.
        expected: String,
        /// The actual previous hash found.
        actual: String,
    },

    /// The record hash doesn't match the computed value.
    #[error("record hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        /// The expected hash.
        expected: String,
        /// The actual hash computed.
        actual: String,
    },
}

/// Hasher for chained audit records using Blake3.
///
/// The `ChainHasher` computes cryptographic hashes of record content and
/// manages hash-chain linking between sequential records: each record's
/// hash covers `prev_hash || content`, so any retroactive edit to an
/// earlier record invalidates every hash computed after it.
pub struct ChainHasher;

impl ChainHasher {
    /// The zero hash used as the previous hash for the genesis record.
    pub const GENESIS_PREV_HASH: Hash = [0u8; HASH_SIZE];

    /// Hashes record content with chain linking.
    ///
    /// The hash is computed over: `prev_hash || content`.
    #[must_use]
    pub fn hash_record(content: &[u8], prev_hash: &Hash) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(prev_hash);
        hasher.update(content);
        *hasher.finalize().as_bytes()
    }

    /// Hashes raw content without chain linking.
    ///
    /// Use this for payload digests and blob handles, which don't
    /// participate in the audit chain.
    #[must_use]
    pub fn hash_content(content: &[u8]) -> Hash {
        *blake3::hash(content).as_bytes()
    }

    /// Verifies that a record hash matches the expected value.
    ///
    /// # Errors
    ///
    /// Returns `HashMismatch` if the computed hash doesn't match.
    pub fn verify_hash(
        content: &[u8],
        prev_hash: &Hash,
        expected_hash: &Hash,
    ) -> Result<(), HashChainError> {
        let computed = Self::hash_record(content, prev_hash);
        if computed != *expected_hash {
            return Err(HashChainError::HashMismatch {
                expected: hex::encode(expected_hash),
                actual: hex::encode(computed),
            });
        }
        Ok(())
    }

    /// Verifies the chain link between two consecutive records.
    ///
    /// # Arguments
    ///
    /// * `current_prev_hash` - The previous hash stored in the current record
    /// * `previous_record_hash` - The computed hash of the previous record
    ///
    /// # Errors
    ///
    /// Returns `ChainBroken` if the hashes don't match.
    pub fn verify_chain_link(
        current_prev_hash: &Hash,
        previous_record_hash: &Hash,
    ) -> Result<(), HashChainError> {
        if current_prev_hash != previous_record_hash {
            return Err(HashChainError::ChainBroken {
                expected: hex::encode(previous_record_hash),
                actual: hex::encode(current_prev_hash),
            });
        }
        Ok(())
    }
}

/// Computes the Blake3 digest of a value's canonical JSON encoding.
///
/// Canonical means `serde_json` serialization with object keys in sorted
/// order (the default `serde_json::Value` map ordering), so two logically
/// identical payloads always digest to the same hash.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn digest_json<T: Serialize>(value: &T) -> Result<Hash, serde_json::Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(ChainHasher::hash_content(&bytes))
}

/// Hex-encodes a digest for display and storage in audit records.
#[must_use]
pub fn digest_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_record_is_chain_linked() {
        let content = b"payload";
        let h1 = ChainHasher::hash_record(content, &ChainHasher::GENESIS_PREV_HASH);
        let h2 = ChainHasher::hash_record(content, &h1);
        assert_ne!(h1, h2);
        // Same inputs reproduce the same hash.
        assert_eq!(
            h1,
            ChainHasher::hash_record(content, &ChainHasher::GENESIS_PREV_HASH)
        );
    }

    #[test]
    fn verify_hash_detects_tampering() {
        let h = ChainHasher::hash_record(b"original", &ChainHasher::GENESIS_PREV_HASH);
        assert!(
            ChainHasher::verify_hash(b"original", &ChainHasher::GENESIS_PREV_HASH, &h).is_ok()
        );
        assert!(
            ChainHasher::verify_hash(b"tampered", &ChainHasher::GENESIS_PREV_HASH, &h).is_err()
        );
    }

    #[test]
    fn verify_chain_link_detects_break() {
        let h1 = ChainHasher::hash_record(b"a", &ChainHasher::GENESIS_PREV_HASH);
        let h2 = ChainHasher::hash_record(b"b", &ChainHasher::GENESIS_PREV_HASH);
        assert!(ChainHasher::verify_chain_link(&h1, &h1).is_ok());
        assert!(ChainHasher::verify_chain_link(&h1, &h2).is_err());
    }

    #[test]
    fn digest_json_is_deterministic() {
        let a = serde_json::json!({"x": 1, "y": [1, 2, 3]});
        let b = serde_json::json!({"y": [1, 2, 3], "x": 1});
        // serde_json Value maps sort keys, so field order doesn't matter.
        assert_eq!(digest_json(&a).unwrap(), digest_json(&b).unwrap());
    }
}
