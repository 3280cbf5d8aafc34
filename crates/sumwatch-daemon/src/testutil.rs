//! Shared helpers for daemon unit tests.

use std::path::PathBuf;
use std::sync::Arc;

use sumwatch_core::Config;
use sumwatch_core::blob::{BlobStore, FsBlobStore};
use sumwatch_core::config::{BlobStoreConfig, BuildWorkerConfig};
use sumwatch_core::worker::{BoxFuture, BuildJob, BuildWorker, WorkerError};

use crate::db::Database;
use crate::signals::SignalRegistry;
use crate::state::{AppState, SharedState};

/// A build worker that always succeeds without doing anything.
pub struct NoopWorker;

impl BuildWorker for NoopWorker {
    fn invoke<'a>(&'a self, _job: &'a BuildJob) -> BoxFuture<'a, Result<(), WorkerError>> {
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &str {
        "noop-worker"
    }
}

/// Configuration pointing at throwaway paths.
pub fn test_config(root: PathBuf) -> Config {
    Config {
        domain: "sumwatch.test".to_string(),
        database_path: root.join("sumwatch.db"),
        blob_store: BlobStoreConfig {
            root: root.join("blobs"),
            base_url: "http://blobs.test".to_string(),
            signing_secret: "test-secret".to_string(),
        },
        build_worker: BuildWorkerConfig {
            name: "noop-worker".to_string(),
            url: "http://worker.test/invoke".to_string(),
            arch: "amd64".to_string(),
        },
        go_dl_url: "https://go.dev/dl".to_string(),
        legacy_bootstrap: None,
        logs: Vec::new(),
    }
}

/// Builds a complete state with one registered log, a customized config,
/// and a worker constructed over the shared blob store.
///
/// Returns the temp dir keeping the blob store alive, the state, and the
/// id of the registered log (host `sum.golang.org`, key `[0x01; 33]`).
pub fn test_state_with(
    configure: impl FnOnce(&mut Config),
    make_worker: impl FnOnce(Arc<dyn BlobStore>) -> Arc<dyn BuildWorker>,
) -> (tempfile::TempDir, SharedState, i64) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let mut config = test_config(dir.path().to_path_buf());
    configure(&mut config);

    let db = Database::open_in_memory().expect("open database");
    db.register_log("sum.golang.org", &[0x01; 33], true)
        .expect("register log");
    let log_id = db
        .log_by_host("sum.golang.org")
        .expect("load log")
        .expect("log registered")
        .id;

    let blob: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::new(
            config.blob_store.root.clone(),
            config.blob_store.base_url.clone(),
            config.blob_store.signing_secret.clone().into_bytes(),
        )
        .expect("create blob store"),
    );

    let state = Arc::new(AppState {
        config,
        db,
        blob: Arc::clone(&blob),
        worker: make_worker(blob),
        client: reqwest::Client::new(),
        signals: SignalRegistry::new([log_id]),
    });
    (dir, state, log_id)
}

/// [`test_state_with`] with defaults: untouched config, [`NoopWorker`].
pub fn test_state() -> (tempfile::TempDir, SharedState, i64) {
    test_state_with(|_| {}, |_| Arc::new(NoopWorker))
}
