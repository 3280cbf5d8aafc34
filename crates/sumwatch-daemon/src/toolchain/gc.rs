//! Garbage collection of build artifacts.
//!
//! Artifacts live under `out/<modversion>.<hex build_id>.{zip,log}` and
//! are kept for diagnosis of `unequal` and `failed` builds. Objects that
//! no longer correspond to a `toolchain_build` row (the verdict was
//! replaced by a re-build, or the object name never parsed) are swept.

use tracing::info;

use sumwatch_core::blob::BlobStore;
use sumwatch_core::hex;

use crate::state::SharedState;

use super::ToolchainError;

/// Splits an `out/` object key into its module version and build id.
#[must_use]
pub fn parse_artifact_key(key: &str) -> Option<(&str, Vec<u8>)> {
    let rest = key.strip_prefix("out/")?;
    let rest = rest
        .strip_suffix(".zip")
        .or_else(|| rest.strip_suffix(".log"))?;
    let (version, build_id) = rest.rsplit_once('.')?;
    let build_id = hex::decode(build_id)?;
    if version.is_empty() || build_id.len() != 16 {
        return None;
    }
    Some((version, build_id))
}

/// Deletes `out/` objects with no matching `toolchain_build` row.
///
/// With `dry_run`, candidates are only logged.
///
/// # Errors
///
/// Returns a [`ToolchainError`] on storage failure.
pub fn garbage_collect(state: &SharedState, dry_run: bool) -> Result<(), ToolchainError> {
    for key in state.blob.list("out/")? {
        let delete_reason = match parse_artifact_key(&key) {
            None => "object name is invalid",
            Some((version, build_id)) => {
                if state.db.build_artifact_exists(version, &build_id)? {
                    continue;
                }
                "no matching toolchain_build row"
            },
        };
        info!(%key, reason = delete_reason, dry_run, "deleting stale artifact");
        if !dry_run {
            state.blob.delete(&key)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BuildResult, BuildStatus};
    use crate::testutil::test_state;

    #[test]
    fn parses_artifact_keys() {
        let build_id = [0xabu8; 16];
        let key = format!(
            "out/v0.0.1-go1.24.0.linux-amd64.{}.zip",
            hex::encode(&build_id)
        );
        let (version, parsed) = parse_artifact_key(&key).unwrap();
        assert_eq!(version, "v0.0.1-go1.24.0.linux-amd64");
        assert_eq!(parsed, build_id);

        for bad in [
            "src/go1.24.0.src.tar.gz",
            "out/missing-build-id.zip",
            "out/v0.0.1-go1.24.0.linux-amd64.abcd.zip",
            "out/v0.0.1-go1.24.0.linux-amd64.abababababababababababababababab.tar",
        ] {
            assert!(parse_artifact_key(bad).is_none(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn sweeps_orphans_and_keeps_live_artifacts() {
        let (_dir, state, _) = test_state();
        let build_id = [0x42u8; 16];
        let live_zip = format!(
            "out/v0.0.1-go1.24.0.linux-amd64.{}.zip",
            hex::encode(&build_id)
        );
        let orphan_log = format!("out/v0.0.1-go1.23.0.linux-amd64.{}.log", hex::encode(&[7u8; 16]));

        state.blob.put(&live_zip, b"zip").unwrap();
        state.blob.put(&orphan_log, b"log").unwrap();
        state.blob.put("out/garbage-name", b"x").unwrap();

        state
            .db
            .store_build_result(
                "v0.0.1-go1.24.0.linux-amd64",
                &BuildResult {
                    status: BuildStatus::Unequal,
                    message: None,
                    build_id: Some(build_id),
                    duration: None,
                },
            )
            .unwrap();

        // Dry run deletes nothing.
        garbage_collect(&state, true).unwrap();
        assert_eq!(state.blob.list("out/").unwrap().len(), 3);

        garbage_collect(&state, false).unwrap();
        assert_eq!(state.blob.list("out/").unwrap(), vec![live_zip]);
    }
}
