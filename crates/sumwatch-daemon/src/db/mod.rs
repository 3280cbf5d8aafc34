//! SQLite storage for the auditor.
//!
//! All daemon state lives in one SQLite database opened in WAL mode. The
//! connection sits behind a mutex and every write path uses explicit
//! transactions; the ingestion checkpoint additionally re-reads the log
//! row it is about to advance and aborts if another writer got there
//! first.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

// SQLite stores positions and tree sizes as i64; they are non-negative by
// construction and far from overflow.
#![allow(
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc
)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use sumwatch_core::merkle::{CollapsedTree, Hash};
use sumwatch_core::sth::Sth;
use sumwatch_core::version::TOOLCHAIN_MODULE;
use sumwatch_core::{gover, version};
use thiserror::Error;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A collapsed-tree snapshot failed to (de)serialize.
    #[error("error encoding tree position: {0}")]
    Json(#[from] serde_json::Error),

    /// No log row exists for the requested log.
    #[error("log not found: {0}")]
    LogNotFound(String),

    /// The log row was modified by another writer since it was loaded.
    #[error("log {0} has been modified by a different writer")]
    ConcurrentModification(i64),

    /// A stored blob has the wrong length for its column.
    #[error("corrupt {column} value in {table} row")]
    CorruptValue {
        /// Table containing the bad value.
        table: &'static str,
        /// Column containing the bad value.
        column: &'static str,
    },
}

/// A monitored log endpoint.
#[derive(Debug, Clone)]
pub struct LogInstance {
    /// Stable numeric id.
    pub id: i64,
    /// Log hostname.
    pub host: String,
    /// Tagged verification key.
    pub key: Vec<u8>,
    /// Whether tasks run for this log.
    pub enabled: bool,
}

/// An STH whose tree size the ingester has not yet reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSth {
    /// Tree size the head commits to.
    pub tree_size: u64,
    /// Root hash the head claims.
    pub root_hash: Hash,
}

/// One record ready to be written by a checkpoint.
#[derive(Debug, Clone)]
pub struct NewRecord {
    /// Position of the leaf in the log.
    pub position: u64,
    /// Module path.
    pub module: String,
    /// Module version.
    pub version: String,
    /// Source hash from the record.
    pub source_sha256: [u8; 32],
    /// go.mod hash from the record.
    pub gomod_sha256: [u8; 32],
    /// Tree root after appending this leaf.
    pub root_hash: Hash,
}

/// An STH that failed its audit, with the root we reconstructed.
#[derive(Debug, Clone)]
pub struct InconsistentSth {
    /// Host of the log that signed the head.
    pub host: String,
    /// Tree size of the head.
    pub tree_size: u64,
    /// Root hash the head claims.
    pub root_hash: Vec<u8>,
    /// Root hash reconstructed from the downloaded records.
    pub calculated_root_hash: Vec<u8>,
    /// The head's signature.
    pub signature: Vec<u8>,
    /// When the head was first observed (Unix seconds).
    pub observed_at: i64,
}

/// A record whose (module, version) already appeared earlier in the log.
#[derive(Debug, Clone)]
pub struct DuplicateRecord {
    /// Host of the log.
    pub host: String,
    /// Position of the later sighting.
    pub position: u64,
    /// Position of the earlier sighting.
    pub previous_position: u64,
    /// Module path.
    pub module: String,
    /// Module version.
    pub version: String,
    /// When the later sighting was ingested (Unix seconds).
    pub observed_at: i64,
}

/// Reproducibility verdict for a toolchain build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// The version predates reproducible builds or lacks a bootstrap.
    Skipped,
    /// The rebuilt artifact matched the log's hash.
    Equal,
    /// The rebuilt artifact differed from the log's hash.
    Unequal,
    /// The build could not be completed.
    Failed,
}

impl BuildStatus {
    /// Storage form of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Equal => "equal",
            Self::Unequal => "unequal",
            Self::Failed => "failed",
        }
    }

    /// Parses the storage form.
    #[must_use]
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "skipped" => Some(Self::Skipped),
            "equal" => Some(Self::Equal),
            "unequal" => Some(Self::Unequal),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A complete build verdict row.
#[derive(Debug, Clone)]
pub struct BuildResult {
    /// Outcome of the attempt.
    pub status: BuildStatus,
    /// Failure or skip explanation.
    pub message: Option<String>,
    /// Handle tying the row to `out/` blob objects.
    pub build_id: Option<[u8; 16]>,
    /// Wall-clock build duration.
    pub duration: Option<Duration>,
}

/// A toolchain build with status other than `equal`/`skipped`.
#[derive(Debug, Clone)]
pub struct ToolchainFailure {
    /// Module version that was built.
    pub version: String,
    /// Verdict status.
    pub status: String,
    /// Failure message.
    pub message: String,
    /// Artifact handle, if a build ran.
    pub build_id: Option<Vec<u8>>,
    /// When the verdict was stored (Unix seconds).
    pub inserted_at: i64,
}

/// A toolchain log record with no build verdict yet.
#[derive(Debug, Clone)]
pub struct UnbuiltToolchain {
    /// Module version string.
    pub version: String,
    /// Source hash recorded in the log.
    pub source_sha256: [u8; 32],
}

/// An observed module version, for the versions feed.
#[derive(Debug, Clone)]
pub struct ObservedVersion {
    /// Module path.
    pub module: String,
    /// Module version.
    pub version: String,
    /// Source hash recorded in the log.
    pub source_sha256: Vec<u8>,
    /// When the record was ingested (Unix seconds).
    pub observed_at: i64,
}

/// Which hash column an authorized go.sum line populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizedColumn {
    /// The module source hash.
    Source,
    /// The go.mod hash.
    Gomod,
}

impl AuthorizedColumn {
    const fn column_name(self) -> &'static str {
        match self {
            Self::Source => "source_sha256",
            Self::Gomod => "gomod_sha256",
        }
    }
}

/// One parsed line of an authorized go.sum manifest.
#[derive(Debug, Clone)]
pub struct AuthorizedEntry {
    /// Module path.
    pub module: String,
    /// Module version (without any `/go.mod` suffix).
    pub version: String,
    /// Which column the hash belongs in.
    pub column: AuthorizedColumn,
    /// The 32-byte hash.
    pub hash: [u8; 32],
}

/// Per-log status summary.
#[derive(Debug, Clone)]
pub struct LogSummary {
    /// Log hostname.
    pub host: String,
    /// Largest observed STH tree size.
    pub largest_sth_size: u64,
    /// When the largest STH was observed (Unix seconds).
    pub largest_sth_time: i64,
    /// Download position size.
    pub download_size: u64,
    /// Verified position size.
    pub verified_size: u64,
}

impl LogSummary {
    /// Records known to exist but not yet downloaded.
    #[must_use]
    pub fn download_backlog(&self) -> u64 {
        self.largest_sth_size.saturating_sub(self.download_size)
    }

    /// Records known to exist but not yet verified against an STH.
    #[must_use]
    pub fn verify_backlog(&self) -> u64 {
        self.largest_sth_size.saturating_sub(self.verified_size)
    }
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn blob32(
    bytes: Vec<u8>,
    table: &'static str,
    column: &'static str,
) -> Result<[u8; 32], DbError> {
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| DbError::CorruptValue { table, column })
}

/// Handle to the daemon's SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (and migrates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] if the file cannot be opened or the schema
    /// cannot be applied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] if the schema cannot be applied.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA_SQL)?;
        // A source row without a hash means a fetch died mid-flight;
        // forget it so the next audit retries the download.
        conn.execute("DELETE FROM toolchain_source WHERE sha256 IS NULL", [])?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("connection mutex poisoned")
    }

    /// Creates or updates the row for a configured log. New logs start
    /// with empty download and verified positions.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn register_log(&self, host: &str, key: &[u8], enabled: bool) -> Result<(), DbError> {
        let empty = serde_json::to_string(&CollapsedTree::new())?;
        self.lock().execute(
            "INSERT INTO log (host, key, enabled, download_position, verified_position)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT (host) DO UPDATE SET key = excluded.key, enabled = excluded.enabled",
            params![host, key, enabled, empty],
        )?;
        Ok(())
    }

    /// Returns all enabled logs, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn enabled_logs(&self) -> Result<Vec<LogInstance>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT log_id, host, key, enabled FROM log WHERE enabled ORDER BY log_id",
        )?;
        let logs = stmt
            .query_map([], |row| {
                Ok(LogInstance {
                    id: row.get(0)?,
                    host: row.get(1)?,
                    key: row.get(2)?,
                    enabled: row.get(3)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(logs)
    }

    /// Looks up a log by host.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn log_by_host(&self, host: &str) -> Result<Option<LogInstance>, DbError> {
        let conn = self.lock();
        let log = conn
            .query_row(
                "SELECT log_id, host, key, enabled FROM log WHERE host = ?1",
                params![host],
                |row| {
                    Ok(LogInstance {
                        id: row.get(0)?,
                        host: row.get(1)?,
                        key: row.get(2)?,
                        enabled: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(log)
    }

    /// Loads a log's host and verification key by id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LogNotFound`] if the id is unknown.
    pub fn log_key(&self, log_id: i64) -> Result<(String, Vec<u8>), DbError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT host, key FROM log WHERE log_id = ?1",
            params![log_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| DbError::LogNotFound(log_id.to_string()))
    }

    /// Inserts an observed STH. Re-observing a known
    /// `(tree_size, root_hash)` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn insert_sth(&self, log_id: i64, sth: &Sth, source: &str) -> Result<(), DbError> {
        self.lock().execute(
            "INSERT INTO sth (log_id, tree_size, root_hash, signature, source, observed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (log_id, tree_size, root_hash) DO NOTHING",
            params![
                log_id,
                sth.tree_size as i64,
                sth.root_hash.as_bytes(),
                sth.signature,
                source,
                now_unix(),
            ],
        )?;
        Ok(())
    }

    /// Returns the stored consistency verdict for an STH: `None` when the
    /// audit has not reached it yet.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure; an STH that was never
    /// inserted also reads as not-yet-audited.
    pub fn sth_consistency(&self, log_id: i64, sth: &Sth) -> Result<Option<bool>, DbError> {
        let conn = self.lock();
        let consistent: Option<Option<bool>> = conn
            .query_row(
                "SELECT consistent FROM sth
                 WHERE log_id = ?1 AND tree_size = ?2 AND root_hash = ?3",
                params![log_id, sth.tree_size as i64, sth.root_hash.as_bytes()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(consistent.flatten())
    }

    /// Returns the STH whose tree size equals the log's verified
    /// position, in parsed form.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn verified_sth(&self, host: &str) -> Result<Option<Sth>, DbError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT sth.tree_size, sth.root_hash, sth.signature
                 FROM log
                 JOIN sth ON sth.log_id = log.log_id
                         AND sth.tree_size =
                             CAST(json_extract(log.verified_position, '$.size') AS INTEGER)
                 WHERE log.host = ?1
                 ORDER BY sth.consistent DESC
                 LIMIT 1",
                params![host],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((tree_size, root, signature)) => Ok(Some(Sth {
                tree_size: tree_size as u64,
                root_hash: Hash::from_slice(&root).ok_or(DbError::CorruptValue {
                    table: "sth",
                    column: "root_hash",
                })?,
                signature,
            })),
        }
    }

    /// Loads the ingestion state: the log's host and download position.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LogNotFound`] if the id is unknown.
    pub fn ingest_state(&self, log_id: i64) -> Result<(String, CollapsedTree), DbError> {
        let conn = self.lock();
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT host, download_position FROM log WHERE log_id = ?1",
                params![log_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (host, position) = row.ok_or_else(|| DbError::LogNotFound(log_id.to_string()))?;
        Ok((host, serde_json::from_str(&position)?))
    }

    /// Returns the unprocessed STHs (one per tree size, ascending) whose
    /// tree size exceeds `after`.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn pending_sths(&self, log_id: i64, after: u64) -> Result<Vec<PendingSth>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT tree_size, MIN(root_hash) FROM sth
             WHERE log_id = ?1 AND tree_size > ?2
             GROUP BY tree_size
             ORDER BY tree_size",
        )?;
        let sths = stmt
            .query_map(params![log_id, after as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        sths.into_iter()
            .map(|(tree_size, root)| {
                Ok(PendingSth {
                    tree_size: tree_size as u64,
                    root_hash: Hash::from_slice(&root).ok_or(DbError::CorruptValue {
                        table: "sth",
                        column: "root_hash",
                    })?,
                })
            })
            .collect()
    }

    /// Commits a batch of records together with the advanced download
    /// position (and, for a verified checkpoint, the verified position).
    ///
    /// The transaction re-reads the log row first; if the host or
    /// download position no longer match `expected`, nothing is written.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::ConcurrentModification`] on a lost race, or a
    /// storage error.
    pub fn checkpoint(
        &self,
        log_id: i64,
        host: &str,
        expected: &CollapsedTree,
        new_position: &CollapsedTree,
        records: &[NewRecord],
        verified: bool,
    ) -> Result<(), DbError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (stored_host, stored_position): (String, String) = tx
            .query_row(
                "SELECT host, download_position FROM log WHERE log_id = ?1",
                params![log_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| DbError::LogNotFound(log_id.to_string()))?;
        let stored: CollapsedTree = serde_json::from_str(&stored_position)?;
        if stored_host != host || stored != *expected {
            return Err(DbError::ConcurrentModification(log_id));
        }

        {
            let mut insert = tx.prepare(
                "INSERT INTO record (log_id, position, module, version, source_sha256,
                                     gomod_sha256, root_hash, observed_at, previous_position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                         (SELECT MAX(position) FROM record
                          WHERE log_id = ?1 AND module = ?3 AND version = ?4
                            AND position < ?2))",
            )?;
            let observed_at = now_unix();
            for record in records {
                insert.execute(params![
                    log_id,
                    record.position as i64,
                    record.module,
                    record.version,
                    record.source_sha256.as_slice(),
                    record.gomod_sha256.as_slice(),
                    record.root_hash.as_bytes(),
                    observed_at,
                ])?;
            }
        }

        let position_json = serde_json::to_string(new_position)?;
        if verified {
            tx.execute(
                "UPDATE log SET download_position = ?1, verified_position = ?1
                 WHERE log_id = ?2",
                params![position_json, log_id],
            )?;
        } else {
            tx.execute(
                "UPDATE log SET download_position = ?1 WHERE log_id = ?2",
                params![position_json, log_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Audits unaudited STHs against reconstructed roots: any STH whose
    /// tree size is within the verified prefix gets `consistent` set by
    /// comparing against the record at `tree_size - 1`.
    ///
    /// Returns the number of STHs audited.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn audit_sths(&self, log_id: i64) -> Result<usize, DbError> {
        let conn = self.lock();
        let verified_size: i64 = conn.query_row(
            "SELECT COALESCE(CAST(json_extract(verified_position, '$.size') AS INTEGER), 0)
             FROM log WHERE log_id = ?1",
            params![log_id],
            |row| row.get(0),
        )?;
        let audited = conn.execute(
            "UPDATE sth
             SET consistent = (sth.root_hash = record.root_hash)
             FROM record
             WHERE record.log_id = sth.log_id
               AND record.position = sth.tree_size - 1
               AND sth.consistent IS NULL
               AND sth.log_id = ?1
               AND sth.tree_size > 0
               AND sth.tree_size <= ?2",
            params![log_id, verified_size],
        )?;
        Ok(audited)
    }

    /// Enumerates STHs that failed their audit.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn inconsistent_sths(&self) -> Result<Vec<InconsistentSth>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT log.host, sth.tree_size, sth.root_hash, record.root_hash,
                    sth.signature, sth.observed_at
             FROM sth
             JOIN log ON log.log_id = sth.log_id
             JOIN record ON record.log_id = sth.log_id
                        AND record.position = sth.tree_size - 1
             WHERE sth.consistent = 0
             ORDER BY sth.observed_at DESC",
        )?;
        let sths = stmt
            .query_map([], |row| {
                Ok(InconsistentSth {
                    host: row.get(0)?,
                    tree_size: row.get::<_, i64>(1)? as u64,
                    root_hash: row.get(2)?,
                    calculated_root_hash: row.get(3)?,
                    signature: row.get(4)?,
                    observed_at: row.get(5)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(sths)
    }

    /// Enumerates records that duplicate an earlier (module, version).
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn duplicate_records(&self) -> Result<Vec<DuplicateRecord>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT log.host, r.position, r.previous_position, r.module, r.version,
                    r.observed_at
             FROM record r
             JOIN log ON log.log_id = r.log_id
             WHERE r.previous_position IS NOT NULL
             ORDER BY r.observed_at DESC",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(DuplicateRecord {
                    host: row.get(0)?,
                    position: row.get::<_, i64>(1)? as u64,
                    previous_position: row.get::<_, i64>(2)? as u64,
                    module: row.get(3)?,
                    version: row.get(4)?,
                    observed_at: row.get(5)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(records)
    }

    /// Enumerates observed versions of a module (or module prefix ending
    /// in `/`). With a pubkey, only versions that publisher has not
    /// authorized are returned.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn observed_versions(
        &self,
        module: &str,
        pubkey: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<ObservedVersion>, DbError> {
        let conn = self.lock();

        let mut sql = String::from(
            "SELECT module, version, source_sha256, observed_at FROM record r WHERE ",
        );
        if module.ends_with('/') {
            sql.push_str("module LIKE ?1 || '%'");
        } else {
            sql.push_str("module = ?1");
        }
        if pubkey.is_some() {
            sql.push_str(
                " AND NOT EXISTS (SELECT 1 FROM authorized_record ar
                   WHERE ar.pubkey = ?2 AND ar.module = r.module
                     AND ar.version = r.version AND ar.source_sha256 = r.source_sha256)",
            );
        }
        sql.push_str(" ORDER BY module, version, log_id, position DESC LIMIT ");
        sql.push_str(&limit.to_string());

        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(ObservedVersion {
                module: row.get(0)?,
                version: row.get(1)?,
                source_sha256: row.get(2)?,
                observed_at: row.get(3)?,
            })
        };
        let rows = match pubkey {
            Some(pubkey) => stmt
                .query_map(params![module, pubkey], map_row)?
                .collect::<Result<_, _>>()?,
            None => stmt
                .query_map(params![module], map_row)?
                .collect::<Result<_, _>>()?,
        };
        Ok(rows)
    }

    /// Upserts all entries of a verified authorized manifest in one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure; nothing is persisted.
    pub fn insert_authorized(
        &self,
        pubkey: &[u8],
        entries: &[AuthorizedEntry],
    ) -> Result<(), DbError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for entry in entries {
            let column = entry.column.column_name();
            tx.execute(
                &format!(
                    "INSERT INTO authorized_record (pubkey, module, version, {column})
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (pubkey, module, version)
                     DO UPDATE SET {column} = excluded.{column}"
                ),
                params![pubkey, entry.module, entry.version, entry.hash.as_slice()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Returns toolchain records with no build verdict yet.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn unbuilt_toolchains(&self) -> Result<Vec<UnbuiltToolchain>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT version, source_sha256 FROM record
             WHERE module = ?1
               AND NOT EXISTS (SELECT 1 FROM toolchain_build
                               WHERE toolchain_build.version = record.version)",
        )?;
        let rows = stmt
            .query_map(params![TOOLCHAIN_MODULE], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(version, hash)| {
                Ok(UnbuiltToolchain {
                    version,
                    source_sha256: blob32(hash, "record", "source_sha256")?,
                })
            })
            .collect()
    }

    /// Finds the highest `equal`-verified toolchain record of language
    /// version `lang` for `linux-<arch>`, returning its module version
    /// and source hash.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn bootstrap_record(
        &self,
        lang: &str,
        arch: &str,
    ) -> Result<Option<(String, [u8; 32])>, DbError> {
        let candidates: Vec<(String, Vec<u8>)> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(
                "SELECT record.version, record.source_sha256
                 FROM record
                 JOIN toolchain_build ON toolchain_build.version = record.version
                 WHERE record.module = ?1
                   AND toolchain_build.status = 'equal'
                   AND record.version LIKE 'v0.0.1-' || ?2 || '%.linux-' || ?3",
            )?;
            let rows = stmt
                .query_map(params![TOOLCHAIN_MODULE, lang, arch], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<_, _>>()?;
            rows
        };

        let best = candidates
            .into_iter()
            .filter_map(|(modversion, hash)| {
                let parsed = version::parse_mod_version(&modversion)?;
                (gover::lang(&parsed.go_version) == lang
                    && parsed.goos == "linux"
                    && parsed.goarch == arch)
                    .then_some((modversion, parsed.go_version, hash))
            })
            .max_by(|(_, a, _), (_, b, _)| gover::compare(a, b));

        match best {
            None => Ok(None),
            Some((modversion, _, hash)) => Ok(Some((
                modversion,
                blob32(hash, "record", "source_sha256")?,
            ))),
        }
    }

    /// Upserts a build verdict. Re-running a build replaces the row.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn store_build_result(&self, modversion: &str, result: &BuildResult) -> Result<(), DbError> {
        self.lock().execute(
            "INSERT INTO toolchain_build
                 (version, status, message, build_id, build_duration_ms, inserted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (version) DO UPDATE SET
                 status = excluded.status,
                 message = excluded.message,
                 build_id = excluded.build_id,
                 build_duration_ms = excluded.build_duration_ms,
                 inserted_at = excluded.inserted_at",
            params![
                modversion,
                result.status.as_str(),
                result.message,
                result.build_id.as_ref().map(|id| id.as_slice()),
                result.duration.map(|d| d.as_millis() as i64),
                now_unix(),
            ],
        )?;
        Ok(())
    }

    /// Returns the stored build status for a module version.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn build_status(&self, modversion: &str) -> Result<Option<BuildStatus>, DbError> {
        let conn = self.lock();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM toolchain_build WHERE version = ?1",
                params![modversion],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(BuildStatus::parse))
    }

    /// Reports whether a `(version, build_id)` pair belongs to a stored
    /// verdict. Used by the artifact garbage collector.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn build_artifact_exists(&self, version: &str, build_id: &[u8]) -> Result<bool, DbError> {
        let conn = self.lock();
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM toolchain_build
                            WHERE version = ?1 AND build_id = ?2)",
            params![version, build_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Enumerates builds whose status is neither `equal` nor `skipped`.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn toolchain_failures(&self) -> Result<Vec<ToolchainFailure>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT version, status, COALESCE(message, ''), build_id, inserted_at
             FROM toolchain_build
             WHERE status NOT IN ('equal', 'skipped')
             ORDER BY inserted_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ToolchainFailure {
                    version: row.get(0)?,
                    status: row.get(1)?,
                    message: row.get(2)?,
                    build_id: row.get(3)?,
                    inserted_at: row.get(4)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    /// Claims the source-cache row for a Go version. Returns `false` if
    /// the row already existed (someone else fetched or is fetching it).
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn try_claim_source(&self, go_version: &str, url: &str) -> Result<bool, DbError> {
        let changed = self.lock().execute(
            "INSERT INTO toolchain_source (version, url)
             VALUES (?1, ?2)
             ON CONFLICT (version) DO NOTHING",
            params![go_version, url],
        )?;
        Ok(changed == 1)
    }

    /// Records the hash of a fetched source tarball.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn finish_source(&self, go_version: &str, sha256: &[u8; 32]) -> Result<(), DbError> {
        self.lock().execute(
            "UPDATE toolchain_source SET sha256 = ?1, downloaded_at = ?2 WHERE version = ?3",
            params![sha256.as_slice(), now_unix(), go_version],
        )?;
        Ok(())
    }

    /// Drops a claimed source row after a failed fetch so it can be
    /// retried later.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn abandon_source(&self, go_version: &str) -> Result<(), DbError> {
        self.lock().execute(
            "DELETE FROM toolchain_source WHERE version = ?1",
            params![go_version],
        )?;
        Ok(())
    }

    /// Per-log status summaries.
    ///
    /// # Errors
    ///
    /// Returns a [`DbError`] on storage failure.
    pub fn log_summaries(&self) -> Result<Vec<LogSummary>, DbError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT host,
                    COALESCE((SELECT MAX(tree_size) FROM sth WHERE sth.log_id = log.log_id), 0),
                    COALESCE((SELECT observed_at FROM sth WHERE sth.log_id = log.log_id
                              ORDER BY tree_size DESC LIMIT 1), 0),
                    COALESCE(CAST(json_extract(download_position, '$.size') AS INTEGER), 0),
                    COALESCE(CAST(json_extract(verified_position, '$.size') AS INTEGER), 0)
             FROM log
             ORDER BY log_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LogSummary {
                    host: row.get(0)?,
                    largest_sth_size: row.get::<_, i64>(1)? as u64,
                    largest_sth_time: row.get(2)?,
                    download_size: row.get::<_, i64>(3)? as u64,
                    verified_size: row.get::<_, i64>(4)? as u64,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }
}
