//! The remote build worker contract.
//!
//! A build worker is an isolated, stateless executor: it downloads the
//! source tarball and bootstrap toolchain named in the job, runs the
//! distribution build, and uploads the produced zip and build log to the
//! presigned URLs, and nothing else. The daemon only ever sees success or an
//! error indicator; artifact bytes travel through the blob store.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::Version;

/// Content type of the uploaded toolchain zip.
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Content type of the uploaded build log.
pub const LOG_CONTENT_TYPE: &str = "text/plain";

/// A boxed future for object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from dispatching a build job.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker could not be invoked at all.
    #[error("error invoking build worker: {0}")]
    Invoke(String),

    /// The worker ran and reported a failure.
    #[error("{0}")]
    Reported(String),
}

/// The event payload handed to a build worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    /// Toolchain to build.
    #[serde(rename = "Version")]
    pub version: JobVersion,

    /// Presigned URL of the source tar.gz to build.
    #[serde(rename = "SourceURL")]
    pub source_url: String,

    /// Presigned URL of the bootstrap toolchain zip.
    #[serde(rename = "BootstrapURL")]
    pub bootstrap_url: String,

    /// Expected h1 dirhash of the bootstrap toolchain zip.
    #[serde(rename = "BootstrapHash")]
    pub bootstrap_hash: String,

    /// Presigned PUT URL for the produced module zip.
    #[serde(rename = "ZipUploadURL")]
    pub zip_upload_url: String,

    /// Presigned PUT URL for the build log.
    #[serde(rename = "LogUploadURL")]
    pub log_upload_url: String,
}

/// Wire form of the toolchain version inside a job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVersion {
    /// Go version, e.g. `go1.24.0`.
    #[serde(rename = "GoVersion")]
    pub go_version: String,

    /// Target operating system.
    #[serde(rename = "GOOS")]
    pub goos: String,

    /// Target architecture.
    #[serde(rename = "GOARCH")]
    pub goarch: String,
}

impl From<&Version> for JobVersion {
    fn from(version: &Version) -> Self {
        Self {
            go_version: version.go_version.clone(),
            goos: version.goos.clone(),
            goarch: version.goarch.clone(),
        }
    }
}

/// Dispatches build jobs to an executor.
///
/// Object safe; the daemon holds a `Box<dyn BuildWorker>`.
pub trait BuildWorker: Send + Sync {
    /// Runs one build job to completion.
    ///
    /// Returns `Ok(())` when the worker built and uploaded the artifact;
    /// the job's log upload happens regardless of outcome.
    fn invoke<'a>(&'a self, job: &'a BuildJob) -> BoxFuture<'a, Result<(), WorkerError>>;

    /// Human-readable name of the worker, for logs and verdicts.
    fn name(&self) -> &str;
}

/// Build worker reached by POSTing the job payload over HTTP.
pub struct HttpBuildWorker {
    client: reqwest::Client,
    url: String,
    name: String,
}

impl HttpBuildWorker {
    /// Creates a worker client for the given invoke URL.
    #[must_use]
    pub fn new(client: reqwest::Client, url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            name: name.into(),
        }
    }
}

impl BuildWorker for HttpBuildWorker {
    fn invoke<'a>(&'a self, job: &'a BuildJob) -> BoxFuture<'a, Result<(), WorkerError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(job)
                .send()
                .await
                .map_err(|err| WorkerError::Invoke(err.to_string()))?;

            let status = response.status();
            let body = response
                .bytes()
                .await
                .map_err(|err| WorkerError::Invoke(err.to_string()))?;
            if status.is_success() {
                Ok(())
            } else {
                let text = String::from_utf8_lossy(&body).trim().to_string();
                if text.is_empty() {
                    Err(WorkerError::Reported(format!("worker returned HTTP {status}")))
                } else {
                    Err(WorkerError::Reported(text))
                }
            }
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}
