//! `SQLite`-backed audit log storage.
//!
//! Uses WAL mode so operators can read the log concurrently with appends.
//! The connection mutex serializes the append path: reading the tail hash
//! and inserting the chained event happen under one lock acquisition, so
//! the chain never forks.

// SQLite returns i64 for row IDs and counts, but they're always non-negative.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use thiserror::Error;

use crate::crypto::{ChainHasher, HASH_SIZE, Hash};
use crate::identity::Identity;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during audit log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Event payload could not be canonicalized.
    #[error("canonicalization error: {0}")]
    Canonicalize(#[from] serde_json::Error),

    /// Event not found.
    #[error("audit event not found: seq={seq}")]
    EventNotFound {
        /// The sequence number that was not found.
        seq: u64,
    },

    /// Hash chain verification failed.
    #[error("audit chain broken at seq={seq}: {details}")]
    ChainBroken {
        /// The sequence number of the first divergent event.
        seq: u64,
        /// Details about the failure.
        details: String,
    },

    /// A stored hash has the wrong length.
    #[error("corrupt hash at seq={seq}: expected {HASH_SIZE} bytes, got {len}")]
    CorruptHash {
        /// The sequence number with the corrupt hash.
        seq: u64,
        /// The stored length.
        len: usize,
    },
}

/// A single event in the audit log.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Sequence number (assigned by the log on append).
    pub seq: Option<u64>,

    /// Event type identifier (see the constants in [`crate::audit`]).
    pub event_type: String,

    /// Correlation id threading related events together.
    pub correlation_id: String,

    /// Subject of the identity that caused the event.
    pub subject: String,

    /// Roles of that identity.
    pub roles: Vec<String>,

    /// Hex Blake3 digest of the request arguments.
    pub argument_digest: String,

    /// Hex Blake3 digest of the result payload, when one exists.
    pub result_digest: Option<String>,

    /// Structured detail (from/to states, attempt counters, reasons).
    pub detail: serde_json::Value,

    /// Timestamp in nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,

    /// Hash of the previous event (populated on append).
    pub prev_hash: Option<Hash>,

    /// Hash of this event's canonical encoding chained to `prev_hash`
    /// (populated on append).
    pub hash: Option<Hash>,
}

/// The canonical view of an event that participates in the hash.
///
/// Sequence number and the hashes themselves are excluded: the sequence is
/// storage-assigned and the chain linkage enters the hash through
/// `prev_hash` as hashing input, not as content.
#[derive(Serialize)]
struct CanonicalEvent<'a> {
    event_type: &'a str,
    correlation_id: &'a str,
    subject: &'a str,
    roles: &'a [String],
    argument_digest: &'a str,
    result_digest: Option<&'a str>,
    detail: &'a serde_json::Value,
    timestamp_ns: u64,
}

impl AuditEvent {
    /// Creates a new event with the current timestamp.
    ///
    /// The `seq`, `prev_hash`, and `hash` fields are populated when the
    /// event is appended to the log.
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        correlation_id: impl Into<String>,
        identity: &Identity,
        argument_digest: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        let timestamp_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        Self {
            seq: None,
            event_type: event_type.into(),
            correlation_id: correlation_id.into(),
            subject: identity.subject.clone(),
            roles: identity.roles.clone(),
            argument_digest: argument_digest.into(),
            result_digest: None,
            detail,
            timestamp_ns,
            prev_hash: None,
            hash: None,
        }
    }

    /// Sets the result digest (builder pattern).
    #[must_use]
    pub fn with_result_digest(mut self, digest: impl Into<String>) -> Self {
        self.result_digest = Some(digest.into());
        self
    }

    /// Canonical bytes that participate in the event hash.
    fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&CanonicalEvent {
            event_type: &self.event_type,
            correlation_id: &self.correlation_id,
            subject: &self.subject,
            roles: &self.roles,
            argument_digest: &self.argument_digest,
            result_digest: self.result_digest.as_deref(),
            detail: &self.detail,
            timestamp_ns: self.timestamp_ns,
        })
    }
}

/// Statistics about the audit log.
#[derive(Debug, Clone, Default)]
pub struct AuditStats {
    /// Total number of events.
    pub event_count: u64,

    /// Highest sequence number (0 if empty).
    pub max_seq: u64,

    /// Database file size in bytes.
    pub db_size_bytes: u64,
}

/// The append-only, hash-chained audit log.
pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
    /// Cached hash of the last appended event (genesis hash when empty).
    /// Guarded by the same discipline as `conn`: only updated while the
    /// connection lock is held.
    tail: Mutex<Hash>,
}

impl AuditLog {
    /// Opens or creates an audit log at the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::from_connection(conn)
    }

    /// Creates an in-memory audit log for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, AuditError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, AuditError> {
        conn.execute_batch(SCHEMA_SQL)?;
        let tail = Self::query_tail_hash(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tail: Mutex::new(tail),
        })
    }

    fn query_tail_hash(conn: &Connection) -> Result<Hash, AuditError> {
        let stored: Option<(i64, Vec<u8>)> = conn
            .query_row(
                "SELECT seq, hash FROM audit_events ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match stored {
            None => Ok(ChainHasher::GENESIS_PREV_HASH),
            Some((seq, bytes)) => {
                bytes
                    .try_into()
                    .map_err(|bytes: Vec<u8>| AuditError::CorruptHash {
                        seq: seq as u64,
                        len: bytes.len(),
                    })
            }
        }
    }

    /// Appends an event, computing its chained hash.
    ///
    /// Returns the assigned sequence number and the event's hash, which is
    /// the new tail of the chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be canonicalized or inserted.
    pub fn append(&self, mut event: AuditEvent) -> Result<(u64, Hash), AuditError> {
        let content = event.canonical_bytes()?;

        // The connection lock covers tail read and insert: one writer at a
        // time, so the chain never forks.
        let conn = self.conn.lock().unwrap();
        let mut tail = self.tail.lock().unwrap();

        let prev_hash = *tail;
        let hash = ChainHasher::hash_record(&content, &prev_hash);
        event.prev_hash = Some(prev_hash);
        event.hash = Some(hash);

        conn.execute(
            "INSERT INTO audit_events (event_type, correlation_id, subject, roles, argument_digest, result_digest, detail, timestamp_ns, prev_hash, hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.event_type,
                event.correlation_id,
                event.subject,
                serde_json::to_string(&event.roles)?,
                event.argument_digest,
                event.result_digest,
                serde_json::to_string(&event.detail)?,
                event.timestamp_ns,
                prev_hash.as_slice(),
                hash.as_slice(),
            ],
        )?;

        *tail = hash;
        let seq = conn.last_insert_rowid() as u64;
        tracing::debug!(seq, event_type = %event.event_type, correlation_id = %event.correlation_id, "audit event appended");
        Ok((seq, hash))
    }

    /// The hash of the last appended event (genesis hash when empty).
    #[must_use]
    pub fn tail_hash(&self) -> Hash {
        *self.tail.lock().unwrap()
    }

    /// Reads events starting from a cursor position.
    ///
    /// Returns up to `limit` events with sequence numbers >= `cursor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn read_from(&self, cursor: u64, limit: u64) -> Result<Vec<AuditEvent>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, event_type, correlation_id, subject, roles, argument_digest, result_digest, detail, timestamp_ns, prev_hash, hash
             FROM audit_events
             WHERE seq >= ?1
             ORDER BY seq ASC
             LIMIT ?2",
        )?;

        let events = stmt
            .query_map(params![cursor, limit], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Reads all events sharing a correlation id, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn read_by_correlation(&self, correlation_id: &str) -> Result<Vec<AuditEvent>, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, event_type, correlation_id, subject, roles, argument_digest, result_digest, detail, timestamp_ns, prev_hash, hash
             FROM audit_events
             WHERE correlation_id = ?1
             ORDER BY seq ASC",
        )?;

        let events = stmt
            .query_map(params![correlation_id], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Reads a single event by sequence number.
    ///
    /// # Errors
    ///
    /// Returns `EventNotFound` if no event exists with that sequence.
    pub fn read_one(&self, seq: u64) -> Result<AuditEvent, AuditError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, event_type, correlation_id, subject, roles, argument_digest, result_digest, detail, timestamp_ns, prev_hash, hash
             FROM audit_events
             WHERE seq = ?1",
        )?;

        stmt.query_row(params![seq], Self::row_to_event)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => AuditError::EventNotFound { seq },
                other => AuditError::Database(other),
            })
    }

    /// Verifies the hash chain starting from a sequence number.
    ///
    /// Recomputes every hash from `from_seq` to the end of the log,
    /// starting from the last known-good previous hash (the genesis hash
    /// when `from_seq <= 1`, otherwise the stored hash of the preceding
    /// event). Fails naming the first divergent event.
    ///
    /// # Errors
    ///
    /// Returns `ChainBroken` at the first event whose stored `prev_hash`
    /// or `hash` does not match the recomputation.
    pub fn verify(&self, from_seq: u64) -> Result<(), AuditError> {
        let mut expected_prev: Hash = if from_seq <= 1 {
            ChainHasher::GENESIS_PREV_HASH
        } else {
            let prev = self.read_one(from_seq - 1)?;
            prev.hash.ok_or(AuditError::CorruptHash {
                seq: from_seq - 1,
                len: 0,
            })?
        };

        let mut cursor = from_seq.max(1);
        let batch_size = 1000u64;

        loop {
            let events = self.read_from(cursor, batch_size)?;
            if events.is_empty() {
                break;
            }

            for event in &events {
                let seq = event.seq.unwrap_or(0);
                let stored_prev = event.prev_hash.ok_or(AuditError::CorruptHash { seq, len: 0 })?;
                let stored_hash = event.hash.ok_or(AuditError::CorruptHash { seq, len: 0 })?;

                if stored_prev != expected_prev {
                    return Err(AuditError::ChainBroken {
                        seq,
                        details: "prev_hash mismatch".to_string(),
                    });
                }

                let content = event.canonical_bytes()?;
                let computed = ChainHasher::hash_record(&content, &expected_prev);
                if computed != stored_hash {
                    return Err(AuditError::ChainBroken {
                        seq,
                        details: "event hash mismatch".to_string(),
                    });
                }

                expected_prev = stored_hash;
            }

            cursor = events.last().map_or(cursor, |e| e.seq.unwrap_or(0) + 1);
        }

        Ok(())
    }

    /// Verifies the entire chain from the genesis event.
    ///
    /// # Errors
    ///
    /// Returns `ChainBroken` at the first divergent event.
    pub fn verify_all(&self) -> Result<(), AuditError> {
        self.verify(1)
    }

    /// Gets statistics about the log.
    ///
    /// # Errors
    ///
    /// Returns an error if statistics cannot be gathered.
    pub fn stats(&self) -> Result<AuditStats, AuditError> {
        let conn = self.conn.lock().unwrap();

        let event_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_events", [], |row| row.get(0))?;
        let max_seq: Option<i64> =
            conn.query_row("SELECT MAX(seq) FROM audit_events", [], |row| row.get(0))?;

        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(AuditStats {
            event_count: event_count as u64,
            max_seq: max_seq.unwrap_or(0) as u64,
            db_size_bytes: (page_count * page_size) as u64,
        })
    }

    fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEvent> {
        let roles_json: String = row.get(4)?;
        let detail_json: String = row.get(7)?;
        let prev_hash: Vec<u8> = row.get(9)?;
        let hash: Vec<u8> = row.get(10)?;

        Ok(AuditEvent {
            seq: Some(row.get::<_, i64>(0)? as u64),
            event_type: row.get(1)?,
            correlation_id: row.get(2)?,
            subject: row.get(3)?,
            roles: serde_json::from_str(&roles_json).unwrap_or_default(),
            argument_digest: row.get(5)?,
            result_digest: row.get(6)?,
            detail: serde_json::from_str(&detail_json).unwrap_or(serde_json::Value::Null),
            timestamp_ns: row.get::<_, i64>(8)? as u64,
            prev_hash: prev_hash.try_into().ok(),
            hash: hash.try_into().ok(),
        })
    }
}
