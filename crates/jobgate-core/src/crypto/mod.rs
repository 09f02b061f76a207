//! Hashing and hash-chain primitives.
//!
//! Everything tamper-evident in jobgate bottoms out here: the audit log's
//! event chain, idempotency payload digests, and content-addressed blob
//! handles all use the same Blake3 primitives.

mod hash;

pub use hash::{ChainHasher, HASH_SIZE, Hash, HashChainError, digest_hex, digest_json};
