//! The reproducible-build orchestrator.
//!
//! Every run scans the log for toolchain records without a verdict,
//! resolves a bootstrap toolchain for each, dispatches an isolated build
//! job, and compares the produced zip's h1 dirhash against the hash the
//! log recorded. Verdicts are one of `skipped`, `equal`, `unequal`, or
//! `failed`, and upserts are idempotent so a re-run simply replaces the
//! row.
//!
//! Bootstrap resolution:
//! - before Go 1.21 nothing is reproducible;
//! - Go 1.21 through 1.23 build with the pre-approved legacy bootstrap
//!   blob from configuration;
//! - Go 1.24 and later build with the highest toolchain of the language
//!   version two minors back (rounded down to even) that this auditor
//!   has itself verified as reproducible.

mod gc;
mod source;

pub use gc::garbage_collect;
pub use source::save_source;

use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngCore;
use rand::rngs::OsRng;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use sumwatch_core::blob::{BlobError, BlobStore};
use sumwatch_core::dirhash::{self, DirhashError, format_hash1};
use sumwatch_core::darwin::HashFixer;
use sumwatch_core::version::{
    self, FIRST_MODERN_BOOTSTRAP_VERSION, Version, modern_bootstrap_lang,
};
use sumwatch_core::worker::{
    BuildJob, BuildWorker, JobVersion, LOG_CONTENT_TYPE, WorkerError, ZIP_CONTENT_TYPE,
};
use sumwatch_core::{gover, hex};

use crate::db::{BuildResult, BuildStatus, DbError};
use crate::state::SharedState;

/// Maximum builds in flight at once.
const MAX_CONCURRENT_BUILDS: usize = 10;

/// Lifetime of presigned URLs handed to build jobs.
pub(crate) const PRESIGN_TTL: Duration = Duration::from_secs(30 * 60);

/// Errors that abort an orchestrator pass (verdict-level failures are
/// stored, not returned).
#[derive(Debug, thiserror::Error)]
pub enum ToolchainError {
    /// Storage failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The blob store failed.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// A source tarball could not be cached.
    #[error(transparent)]
    Source(#[from] source::SourceError),
}

fn failed(message: impl Into<String>) -> BuildResult {
    BuildResult {
        status: BuildStatus::Failed,
        message: Some(message.into()),
        build_id: None,
        duration: None,
    }
}

fn skipped(message: impl Into<String>) -> BuildResult {
    BuildResult {
        status: BuildStatus::Skipped,
        message: Some(message.into()),
        build_id: None,
        duration: None,
    }
}

/// The module proxy URL of a published toolchain zip.
fn toolchain_url(modversion: &str) -> String {
    format!("https://proxy.golang.org/golang.org/toolchain/@v/{modversion}.zip")
}

/// Tries to build every toolchain in the log that has no verdict yet.
///
/// Versions whose records disagree on the source hash fail immediately;
/// the rest are audited with bounded concurrency.
///
/// # Errors
///
/// Returns a [`ToolchainError`] on storage failure. Individual build
/// failures become `failed` verdicts instead of errors.
pub async fn audit_all(state: &SharedState) -> Result<(), ToolchainError> {
    let mut unbuilt = state.db.unbuilt_toolchains()?;
    unbuilt.sort_by(|a, b| a.version.cmp(&b.version));

    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_BUILDS));
    let mut audits = Vec::new();

    let mut i = 0;
    while i < unbuilt.len() {
        let version = unbuilt[i].version.clone();
        let source_sha256 = unbuilt[i].source_sha256;
        i += 1;

        let mut inconsistent = false;
        while i < unbuilt.len() && unbuilt[i].version == version {
            if unbuilt[i].source_sha256 != source_sha256 {
                inconsistent = true;
            }
            i += 1;
        }
        if inconsistent {
            warn!(%version, "toolchain has conflicting checksums in the log");
            state.db.store_build_result(
                &version,
                &failed("log contains more than one checksum for this toolchain"),
            )?;
            continue;
        }

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let state = state.clone();
        audits.push(tokio::spawn(async move {
            let _permit = permit;
            if let Err(err) = audit(&state, &version, &format_hash1(&source_sha256)).await {
                error!(%version, error = %err, "error auditing toolchain");
            }
        }));
    }

    for audit in audits {
        audit.await.expect("toolchain audit task panicked");
    }
    Ok(())
}

/// Checks that building one toolchain reproduces the log's checksum.
///
/// # Errors
///
/// Returns a [`ToolchainError`] on infrastructure failure; build-level
/// problems are stored as verdicts.
pub async fn audit(
    state: &SharedState,
    modversion: &str,
    expected_hash: &str,
) -> Result<(), ToolchainError> {
    let Some(version) = version::parse_mod_version(modversion) else {
        state
            .db
            .store_build_result(modversion, &failed("unable to parse module version"))?;
        return Ok(());
    };

    let mut expected_hash = expected_hash.to_string();
    if version.goos == "darwin" {
        // Hash the upstream zip with the signatures stripped; that is
        // what an unsigned rebuild can be compared against.
        match fixed_hash(state, &version, &expected_hash).await {
            Ok(fixed) => expected_hash = fixed,
            Err(err) => {
                state
                    .db
                    .store_build_result(&version.mod_version(), &failed(err.to_string()))?;
                return Ok(());
            },
        }
    }

    if !version::is_reproducible(&version.go_version) {
        state.db.store_build_result(
            &version.mod_version(),
            &skipped("this version of Go is not reproducible"),
        )?;
        return Ok(());
    }

    if gover::compare(&version.go_version, FIRST_MODERN_BOOTSTRAP_VERSION)
        == std::cmp::Ordering::Less
    {
        let Some(legacy) = state.config.legacy_bootstrap.clone() else {
            state.db.store_build_result(
                &version.mod_version(),
                &skipped("legacy bootstrap toolchain not configured"),
            )?;
            return Ok(());
        };
        let bootstrap_url = state.blob.presign_get(&legacy.object, PRESIGN_TTL)?;
        build(state, &version, &expected_hash, bootstrap_url, legacy.hash).await
    } else {
        let lang = modern_bootstrap_lang(&version.go_version);
        match state
            .db
            .bootstrap_record(&lang, &state.config.build_worker.arch)?
        {
            None => {
                state.db.store_build_result(
                    &version.mod_version(),
                    &failed(format!(
                        "no toolchain of {lang} for linux-{} verified reproducible yet",
                        state.config.build_worker.arch
                    )),
                )?;
                Ok(())
            },
            Some((bootstrap_modversion, bootstrap_sha256)) => {
                build(
                    state,
                    &version,
                    &expected_hash,
                    toolchain_url(&bootstrap_modversion),
                    format_hash1(&bootstrap_sha256),
                )
                .await
            },
        }
    }
}

async fn build(
    state: &SharedState,
    version: &Version,
    expected_hash: &str,
    bootstrap_url: String,
    bootstrap_hash: String,
) -> Result<(), ToolchainError> {
    let source_url = match save_source(state, &version.go_version).await? {
        Some(url) => url,
        // Someone already cached this tarball; presign the existing object.
        None => state
            .blob
            .presign_get(&source::source_object_name(&version.go_version), PRESIGN_TTL)?,
    };

    let mut build_id = [0u8; 16];
    OsRng.fill_bytes(&mut build_id);
    let zip_object = format!("out/{}.{}.zip", version.mod_version(), hex::encode(&build_id));
    let log_object = format!("out/{}.{}.log", version.mod_version(), hex::encode(&build_id));

    let job = BuildJob {
        version: JobVersion::from(version),
        source_url,
        bootstrap_url,
        bootstrap_hash,
        zip_upload_url: state
            .blob
            .presign_put(&zip_object, PRESIGN_TTL, ZIP_CONTENT_TYPE)?,
        log_upload_url: state
            .blob
            .presign_put(&log_object, PRESIGN_TTL, LOG_CONTENT_TYPE)?,
    };

    info!(
        worker = state.worker.name(),
        go_version = %version.go_version,
        goos = %version.goos,
        goarch = %version.goarch,
        "dispatching build job"
    );
    let start = Instant::now();
    let outcome = state.worker.invoke(&job).await;
    let duration = start.elapsed();

    let mut result = BuildResult {
        status: BuildStatus::Failed,
        message: None,
        build_id: Some(build_id),
        duration: Some(duration),
    };
    match outcome {
        Err(WorkerError::Invoke(message) | WorkerError::Reported(message)) => {
            result.message = Some(message);
        },
        Ok(()) => match compare(state, &zip_object, expected_hash) {
            Err(err) => result.message = Some(err.to_string()),
            Ok(true) => {
                result.status = BuildStatus::Equal;
                state.blob.delete(&zip_object)?;
            },
            Ok(false) => result.status = BuildStatus::Unequal,
        },
    }

    info!(
        modversion = %version.mod_version(),
        status = result.status.as_str(),
        duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "build verdict"
    );
    state
        .db
        .store_build_result(&version.mod_version(), &result)?;
    Ok(())
}

/// Compares the zip a worker uploaded against the expected h1 hash.
fn compare(state: &SharedState, zip_object: &str, expected_hash: &str) -> Result<bool, String> {
    let zip = state
        .blob
        .get(zip_object)
        .map_err(|err| format!("error reading built toolchain: {err}"))?;
    let got = dirhash::hash_zip_reader(Cursor::new(zip), HashFixer::None)
        .map_err(|err| format!("error hashing built toolchain: {err}"))?;
    Ok(got == expected_hash)
}

/// Downloads the published darwin toolchain, checks it against the log's
/// hash, and re-hashes it with code signatures stripped.
async fn fixed_hash(
    state: &SharedState,
    version: &Version,
    expected_hash: &str,
) -> Result<String, FixedHashError> {
    let url = toolchain_url(&version.mod_version());
    let zip = download_to_temp_file(&state.client, &url).await?;

    let got = dirhash::hash_zip(zip.path(), HashFixer::None)?;
    if got != expected_hash {
        return Err(FixedHashError::UnexpectedHash {
            url,
            got,
            expected: expected_hash.to_string(),
        });
    }
    Ok(dirhash::hash_zip(zip.path(), HashFixer::StripDarwinSig)?)
}

#[derive(Debug, thiserror::Error)]
enum FixedHashError {
    #[error("error downloading toolchain: {0}")]
    Download(String),

    #[error(transparent)]
    Dirhash(#[from] DirhashError),

    #[error("toolchain downloaded from {url} has unexpected hash {got} (expected {expected})")]
    UnexpectedHash {
        url: String,
        got: String,
        expected: String,
    },
}

impl From<std::io::Error> for FixedHashError {
    fn from(err: std::io::Error) -> Self {
        Self::Download(err.to_string())
    }
}

async fn download_to_temp_file(
    client: &reqwest::Client,
    url: &str,
) -> Result<tempfile::NamedTempFile, FixedHashError> {
    use std::io::Write;

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|err| FixedHashError::Download(err.to_string()))?;
    if !response.status().is_success() {
        return Err(FixedHashError::Download(format!(
            "{url}: HTTP {}",
            response.status()
        )));
    }
    let mut file = tempfile::NamedTempFile::new()?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| FixedHashError::Download(err.to_string()))?
    {
        file.write_all(&chunk)?;
    }
    file.flush()?;
    Ok(file)
}
