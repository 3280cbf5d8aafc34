//! The source-tarball cache.
//!
//! Build jobs compile from the canonical release tarballs published at
//! `go.dev/dl`. Each tarball is fetched once, hashed, and parked in the
//! blob store under `src/`; jobs then receive presigned GET URLs instead
//! of hitting go.dev.
//!
//! The cache row doubles as a claim: inserting it wins the right to
//! fetch, a conflict means someone else already did (or is doing) the
//! work, and a failed fetch deletes the row so the next caller retries.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::info;

use sumwatch_core::blob::{BlobError, BlobStore};

use crate::db::DbError;
use crate::state::SharedState;

use super::PRESIGN_TTL;

/// Hard deadline for fetching one source tarball.
const FETCH_DEADLINE: Duration = Duration::from_secs(60);

/// Errors from caching a source tarball.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Storage failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The blob store failed.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// The tarball could not be downloaded in time.
    #[error("error downloading {url}: {message}")]
    Download {
        /// URL that failed.
        url: String,
        /// What went wrong.
        message: String,
    },
}

/// Blob-store key of a cached source tarball.
pub(crate) fn source_object_name(go_version: &str) -> String {
    format!("src/{go_version}.src.tar.gz")
}

/// Ensures the source tarball for `go_version` is cached and returns a
/// presigned GET URL for it, or `None` if another caller holds the
/// cache row, in which case the existing object should be presigned
/// instead.
///
/// # Errors
///
/// Returns a [`SourceError`] if the fetch or store fails; the claim is
/// released so a later call can retry.
pub async fn save_source(
    state: &SharedState,
    go_version: &str,
) -> Result<Option<String>, SourceError> {
    let url = format!(
        "{}/{go_version}.src.tar.gz",
        state.config.go_dl_url.trim_end_matches('/')
    );
    if !state.db.try_claim_source(go_version, &url)? {
        return Ok(None);
    }

    match fetch_and_store(state, go_version, &url).await {
        Ok(()) => {
            let presigned = state
                .blob
                .presign_get(&source_object_name(go_version), PRESIGN_TTL)?;
            Ok(Some(presigned))
        },
        Err(err) => {
            state.db.abandon_source(go_version)?;
            Err(err)
        },
    }
}

async fn fetch_and_store(
    state: &SharedState,
    go_version: &str,
    url: &str,
) -> Result<(), SourceError> {
    let download = async {
        let response = state
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status()));
        }
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| err.to_string())
    };
    let source = tokio::time::timeout(FETCH_DEADLINE, download)
        .await
        .map_err(|_| SourceError::Download {
            url: url.to_string(),
            message: format!("deadline of {FETCH_DEADLINE:?} exceeded"),
        })?
        .map_err(|message| SourceError::Download {
            url: url.to_string(),
            message,
        })?;

    let sha256: [u8; 32] = Sha256::digest(&source).into();
    state.blob.put(&source_object_name(go_version), &source)?;
    state.db.finish_source(go_version, &sha256)?;
    info!(go_version, bytes = source.len(), "cached Go source tarball");
    Ok(())
}
