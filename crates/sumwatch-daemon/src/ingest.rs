//! The ingestion engine.
//!
//! Per run, the engine loads the log's download position (a collapsed
//! Merkle tree) and the pending STHs above it, streams the missing
//! records from the tile downloader, and replays each leaf through the
//! tree. Records accumulate in a batch that is committed at three kinds
//! of checkpoint:
//!
//! - **Verified**: the tree size reached a pending STH and the
//!   reconstructed root matches, and the batch, the download position, and
//!   the verified position commit together.
//! - **Intermediate**: every [`CHECKPOINT_INTERVAL`] records, the batch
//!   and download position commit without advancing verification.
//! - **Final**: whatever remains when the stream ends commits like an
//!   intermediate checkpoint.
//!
//! A pending STH whose root does not match is dropped from the ladder
//! and left for the auditor to flag; ingestion keeps going. Every
//! checkpoint transaction re-reads the log row, so two engines racing on
//! one log cannot interleave their batches.

use std::collections::VecDeque;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sumwatch_core::merkle::CollapsedTree;
use sumwatch_core::tile::{self, DownloadError, RECORDS_PER_TILE};

use crate::db::{DbError, NewRecord, PendingSth};
use crate::state::{SharedState, log_base_url};

/// Records per intermediate checkpoint.
pub const CHECKPOINT_INTERVAL: usize = 10_000;

/// Errors that abort an ingestion run.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Storage failed (including a lost optimistic-concurrency race).
    #[error(transparent)]
    Db(#[from] DbError),

    /// The record download ended before the range was complete.
    #[error(transparent)]
    Download(#[from] DownloadError),
}

struct IngestRun<'a> {
    state: &'a SharedState,
    log_id: i64,
    host: String,
    /// Tree as of the last committed checkpoint.
    committed: CollapsedTree,
    /// Tree including the in-flight batch.
    tree: CollapsedTree,
    batch: Vec<NewRecord>,
    pending: VecDeque<PendingSth>,
}

impl IngestRun<'_> {
    fn commit(&mut self, verified: bool) -> Result<(), DbError> {
        self.state.db.checkpoint(
            self.log_id,
            &self.host,
            &self.committed,
            &self.tree,
            &self.batch,
            verified,
        )?;
        debug!(
            host = %self.host,
            size = self.tree.size(),
            records = self.batch.len(),
            verified,
            "ingest checkpoint"
        );
        self.batch.clear();
        self.committed = self.tree.clone();
        self.state.signals.raise_new_position(self.log_id);
        Ok(())
    }

    fn add_record(&mut self, record: &sumwatch_core::Record) -> Result<(), DbError> {
        let position = self.tree.size();
        self.tree.add(record.leaf_hash());
        let root = self.tree.calculate_root();

        self.batch.push(NewRecord {
            position,
            module: record.module.clone(),
            version: record.version.clone(),
            source_sha256: record.source_sha256,
            gomod_sha256: record.gomod_sha256,
            root_hash: root,
        });

        if let Some(next) = self.pending.front() {
            if self.tree.size() == next.tree_size {
                if root == next.root_hash {
                    self.commit(true)?;
                } else {
                    // Leave the mismatch for the STH auditor to flag.
                    warn!(
                        host = %self.host,
                        tree_size = next.tree_size,
                        calculated = ?root,
                        expected = ?next.root_hash,
                        "root hash does not match STH"
                    );
                }
                self.pending.pop_front();
            }
        }

        if self.batch.len() >= CHECKPOINT_INTERVAL {
            self.commit(false)?;
        }
        Ok(())
    }
}

/// Runs one ingestion pass for a log.
///
/// Returns `false` when there was nothing to do (no STH above the
/// current download position). State committed by earlier checkpoints
/// survives any mid-stream failure.
///
/// # Errors
///
/// Returns an [`IngestError`] on storage failure, cancellation, or a
/// downloader that gave up.
pub async fn ingest(
    state: &SharedState,
    log_id: i64,
    cancel: &CancellationToken,
) -> Result<bool, IngestError> {
    let (host, tree) = state.db.ingest_state(log_id)?;
    let pending: VecDeque<PendingSth> =
        state.db.pending_sths(log_id, tree.size())?.into();
    let Some(last) = pending.back() else {
        return Ok(false);
    };

    let begin = tree.size();
    let end = last.tree_size;
    info!(%host, begin, end, "ingesting records");

    let (records_tx, mut records_rx) =
        mpsc::channel(2 * usize::try_from(RECORDS_PER_TILE).expect("tile size fits usize"));
    let downloader = {
        let client = state.client.clone();
        let base_url = log_base_url(&host);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tile::download_records(&client, &base_url, begin, end, records_tx, &cancel).await
        })
    };

    let mut run = IngestRun {
        state,
        log_id,
        host,
        committed: tree.clone(),
        tree,
        batch: Vec::new(),
        pending,
    };

    while let Some(record) = records_rx.recv().await {
        run.add_record(&record)?;
    }
    downloader
        .await
        .expect("record downloader task panicked")?;

    if !run.batch.is_empty() {
        run.commit(false)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use axum::Router;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use sumwatch_core::Record;
    use sumwatch_core::merkle::Hash;
    use sumwatch_core::sth::Sth;

    use super::*;
    use crate::testutil::test_state;

    fn test_record(position: u64) -> Record {
        let mut source = [0u8; 32];
        source[..8].copy_from_slice(&position.to_be_bytes());
        Record {
            module: "example.com/mod".to_string(),
            version: format!("v1.0.{position}"),
            source_sha256: source,
            gomod_sha256: [0xaa; 32],
        }
    }

    /// Serves positions 0..512 as proper tiles (two full tiles).
    async fn serve_test_log() -> String {
        let router = Router::new().route(
            "/tile/8/data/{*rest}",
            get(|Path(rest): Path<String>| async move {
                let first = match rest.as_str() {
                    "000" => 0u64,
                    "001" => 256,
                    other => panic!("unexpected tile request {other}"),
                };
                let mut body = Vec::new();
                for position in first..first + 256 {
                    if !body.is_empty() {
                        body.push(b'\n');
                    }
                    body.extend_from_slice(&test_record(position).format());
                }
                (StatusCode::OK, body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn true_root(size: u64) -> Hash {
        let mut tree = CollapsedTree::new();
        for position in 0..size {
            tree.add(test_record(position).leaf_hash());
        }
        tree.calculate_root()
    }

    fn unsigned_sth(tree_size: u64, root_hash: Hash) -> Sth {
        Sth {
            tree_size,
            root_hash,
            signature: vec![0; 68],
        }
    }

    #[tokio::test]
    async fn ingest_converges_on_valid_sths() {
        let (_dir, state, _) = test_state();
        let host = serve_test_log().await;
        state.db.register_log(&host, &[0x01; 33], true).unwrap();
        let log_id = state.db.log_by_host(&host).unwrap().unwrap().id;

        // STHs at 256 and 512 whose roots match the true Merkle roots.
        state
            .db
            .insert_sth(log_id, &unsigned_sth(256, true_root(256)), "test")
            .unwrap();
        state
            .db
            .insert_sth(log_id, &unsigned_sth(512, true_root(512)), "test")
            .unwrap();

        let cancel = CancellationToken::new();
        let progressed = ingest(&state, log_id, &cancel).await.unwrap();
        assert!(progressed);

        let (_, position) = state.db.ingest_state(log_id).unwrap();
        assert_eq!(position.size(), 512);
        let summary = state
            .db
            .log_summaries()
            .unwrap()
            .into_iter()
            .find(|s| s.host == host)
            .unwrap();
        assert_eq!(summary.verified_size, 512);
        assert_eq!(summary.download_size, 512);

        // Every record landed with the root of its prefix.
        state.db.audit_sths(log_id).unwrap();
        assert!(state.db.inconsistent_sths().unwrap().is_empty());

        // Re-running on a caught-up log is a no-op.
        let progressed = ingest(&state, log_id, &cancel).await.unwrap();
        assert!(!progressed);
        let (_, position) = state.db.ingest_state(log_id).unwrap();
        assert_eq!(position.size(), 512);
    }

    #[tokio::test]
    async fn ingest_keeps_going_past_wrong_sth() {
        let (_dir, state, _) = test_state();
        let host = serve_test_log().await;
        state.db.register_log(&host, &[0x01; 33], true).unwrap();
        let log_id = state.db.log_by_host(&host).unwrap().unwrap().id;

        // The STH at 256 claims a wrong root; the one at 512 is correct.
        let forged = unsigned_sth(256, sumwatch_core::merkle::hash_leaf(b"forged"));
        state.db.insert_sth(log_id, &forged, "gossip").unwrap();
        state
            .db
            .insert_sth(log_id, &unsigned_sth(512, true_root(512)), "test")
            .unwrap();

        let cancel = CancellationToken::new();
        ingest(&state, log_id, &cancel).await.unwrap();

        // All 512 records were still committed.
        let (_, position) = state.db.ingest_state(log_id).unwrap();
        assert_eq!(position.size(), 512);

        // The auditor then flags the forged head.
        state.db.audit_sths(log_id).unwrap();
        let inconsistent = state.db.inconsistent_sths().unwrap();
        assert_eq!(inconsistent.len(), 1);
        assert_eq!(inconsistent[0].tree_size, 256);
        assert_eq!(inconsistent[0].root_hash, forged.root_hash.as_bytes());
        assert_eq!(
            inconsistent[0].calculated_root_hash,
            true_root(256).as_bytes()
        );
    }

    #[tokio::test]
    async fn ingest_resumes_from_intermediate_position() {
        let (_dir, state, _) = test_state();
        let host = serve_test_log().await;
        state.db.register_log(&host, &[0x01; 33], true).unwrap();
        let log_id = state.db.log_by_host(&host).unwrap().unwrap().id;

        // First pass: only the STH at 256 is known.
        state
            .db
            .insert_sth(log_id, &unsigned_sth(256, true_root(256)), "test")
            .unwrap();
        let cancel = CancellationToken::new();
        ingest(&state, log_id, &cancel).await.unwrap();
        let (_, position) = state.db.ingest_state(log_id).unwrap();
        assert_eq!(position.size(), 256);

        // Second pass continues from the stored frontier.
        state
            .db
            .insert_sth(log_id, &unsigned_sth(512, true_root(512)), "test")
            .unwrap();
        ingest(&state, log_id, &cancel).await.unwrap();
        let (_, position) = state.db.ingest_state(log_id).unwrap();
        assert_eq!(position.size(), 512);
        assert_eq!(position.calculate_root(), true_root(512));
    }

    #[tokio::test]
    async fn cancelled_ingest_fails_without_losing_checkpoints() {
        let (_dir, state, _) = test_state();
        let host = serve_test_log().await;
        state.db.register_log(&host, &[0x01; 33], true).unwrap();
        let log_id = state.db.log_by_host(&host).unwrap().unwrap().id;

        state
            .db
            .insert_sth(log_id, &unsigned_sth(512, true_root(512)), "test")
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ingest(&state, log_id, &cancel).await.unwrap_err();
        assert!(matches!(err, IngestError::Download(DownloadError::Cancelled)));

        let (_, position) = state.db.ingest_state(log_id).unwrap();
        assert_eq!(position.size(), 0);
    }
}
