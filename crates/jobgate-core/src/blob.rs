//! Claim-check storage for large result payloads.
//!
//! The registry only ever stores small handles; the bytes behind them live
//! in a blob store collaborator. Handles are content-addressed (the hex
//! Blake3 digest of the content), so storing identical bytes twice yields
//! the same handle.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::crypto::ChainHasher;

/// Opaque pointer to a stored payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobHandle(String);

impl BlobHandle {
    /// Wraps an existing handle string (as read back from the registry).
    #[must_use]
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// The handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from blob store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlobError {
    /// No payload exists for the handle.
    #[error("blob not found: {handle}")]
    NotFound {
        /// The unknown handle.
        handle: String,
    },

    /// The backing store failed.
    #[error("blob store error: {0}")]
    Storage(String),
}

/// Store for large result payloads, exchanged for claim-check handles.
pub trait BlobStore: Send + Sync {
    /// Stores bytes and returns their handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails.
    fn store(&self, bytes: &[u8]) -> Result<BlobHandle, BlobError>;

    /// Deletes the payload behind a handle.
    ///
    /// Deleting an unknown handle is an error so retention sweeps surface
    /// double-delete bugs instead of hiding them.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no payload exists for the handle.
    fn delete(&self, handle: &BlobHandle) -> Result<(), BlobError>;

    /// Fetches the payload behind a handle.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no payload exists for the handle.
    fn fetch(&self, handle: &BlobHandle) -> Result<Vec<u8>, BlobError>;
}

/// In-memory content-addressed blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payloads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().unwrap().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, bytes: &[u8]) -> Result<BlobHandle, BlobError> {
        let handle = hex::encode(ChainHasher::hash_content(bytes));
        self.blobs
            .lock()
            .unwrap()
            .insert(handle.clone(), bytes.to_vec());
        Ok(BlobHandle(handle))
    }

    fn delete(&self, handle: &BlobHandle) -> Result<(), BlobError> {
        match self.blobs.lock().unwrap().remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(BlobError::NotFound {
                handle: handle.0.clone(),
            }),
        }
    }

    fn fetch(&self, handle: &BlobHandle) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .unwrap()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                handle: handle.0.clone(),
            })
    }
}
