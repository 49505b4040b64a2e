//! Client for the remote sandbox sidecar.
//!
//! The sidecar owns process and filesystem isolation; this module only issues
//! one request per sandbox primitive and surfaces failures as
//! [`SidecarError`]. Nothing here retries a mutation: writes and commands are
//! not idempotent, so a blind retry could run them twice. The one exception is
//! [`get_preview_url`], which polls a read-only endpoint under a
//! [`RetryPolicy`].
//!
//! # Endpoints
//!
//! ```text
//! POST /sandbox/create        {sandbox_id}
//! POST /sandbox/write-files   {sandbox_id, files: {path: content}}
//! POST /sandbox/list-files    {sandbox_id, path}          -> {files: [...]}
//! POST /sandbox/read-file     {sandbox_id, file_path}     -> {filePath, content, error?}
//! POST /sandbox/run-command   {sandbox_id, command, background}
//! POST /sandbox/tunnel-url    {sandbox_id}                -> {previewUrl, status}
//! POST /sandbox/terminate     {sandbox_id}
//! ```

mod client;
mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use client::SidecarClient;
pub use types::{
    CreateAck, FileContent, FileListing, PreviewStatus, PreviewUrl, RunOutput, WriteAck,
};

use crate::retry::{RetryPolicy, Sleeper};

/// Errors surfaced at the sidecar client boundary.
#[derive(Debug, Error)]
pub enum SidecarError {
    /// The sidecar answered with a non-2xx status.
    #[error("sidecar {endpoint} failed ({status}): {body}")]
    Status {
        /// Endpoint path, e.g. `/sandbox/write-files`.
        endpoint: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },
    /// The request never produced a response.
    #[error("sidecar {endpoint} transport error: {source}")]
    Transport {
        /// Endpoint path.
        endpoint: &'static str,
        /// Underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },
    /// The response body did not match the expected shape.
    #[error("sidecar {endpoint} returned an unexpected body: {message}")]
    Decode {
        /// Endpoint path.
        endpoint: &'static str,
        /// Decoder message.
        message: String,
    },
}

impl SidecarError {
    /// The endpoint the failing request targeted.
    pub fn endpoint(&self) -> &'static str {
        match self {
            SidecarError::Status { endpoint, .. }
            | SidecarError::Transport { endpoint, .. }
            | SidecarError::Decode { endpoint, .. } => endpoint,
        }
    }

    /// The HTTP status, if the sidecar answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            SidecarError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One method per sandbox primitive.
///
/// Implementations must be safe to share across tasks. Two sandbox ids are
/// fully independent; concurrency between them is the sidecar's concern.
#[async_trait]
pub trait Sidecar: Send + Sync {
    /// Create (or restore) the sandbox. Creating an existing id is a no-op
    /// on the sidecar side, but still costs a request.
    async fn create(&self, sandbox_id: &str) -> Result<CreateAck, SidecarError>;

    /// Write files, keyed by absolute path.
    async fn write_files(
        &self,
        sandbox_id: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<WriteAck, SidecarError>;

    /// List regular files under `path`.
    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<FileListing, SidecarError>;

    /// Read one file. A missing file is reported in the result, not as an error.
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, SidecarError>;

    /// Run a shell command. With `background` set the call returns as soon as
    /// the process is launched; otherwise it blocks until the process exits.
    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        background: bool,
    ) -> Result<RunOutput, SidecarError>;

    /// Ask once for the preview tunnel URL.
    async fn tunnel_url(&self, sandbox_id: &str) -> Result<PreviewUrl, SidecarError>;

    /// Snapshot and terminate the sandbox.
    async fn terminate(&self, sandbox_id: &str) -> Result<(), SidecarError>;
}

#[async_trait]
impl<S: Sidecar + ?Sized> Sidecar for Arc<S> {
    async fn create(&self, sandbox_id: &str) -> Result<CreateAck, SidecarError> {
        (**self).create(sandbox_id).await
    }

    async fn write_files(
        &self,
        sandbox_id: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<WriteAck, SidecarError> {
        (**self).write_files(sandbox_id, files).await
    }

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<FileListing, SidecarError> {
        (**self).list_files(sandbox_id, path).await
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, SidecarError> {
        (**self).read_file(sandbox_id, path).await
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        background: bool,
    ) -> Result<RunOutput, SidecarError> {
        (**self).run_command(sandbox_id, command, background).await
    }

    async fn tunnel_url(&self, sandbox_id: &str) -> Result<PreviewUrl, SidecarError> {
        (**self).tunnel_url(sandbox_id).await
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), SidecarError> {
        (**self).terminate(sandbox_id).await
    }
}

/// Poll the tunnel endpoint until it reports a URL or the policy runs out.
///
/// Exhausting the policy is a soft timeout: the result is
/// [`PreviewUrl::not_ready`], not an error, because the tunnel may simply need
/// more startup time. Transport and status errors end the poll immediately.
pub async fn get_preview_url(
    sidecar: &dyn Sidecar,
    sandbox_id: &str,
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
) -> Result<PreviewUrl, SidecarError> {
    let found = policy
        .poll(sleeper, |attempt| async move {
            tracing::debug!(
                sandbox_id,
                attempt,
                max_attempts = policy.max_attempts,
                "polling preview url"
            );
            let result = sidecar.tunnel_url(sandbox_id).await?;
            Ok::<_, SidecarError>(result.preview_url)
        })
        .await?;

    match found {
        Some(url) => {
            tracing::info!(sandbox_id, %url, "preview url ready");
            Ok(PreviewUrl::ready(url))
        }
        None => {
            tracing::warn!(
                sandbox_id,
                attempts = policy.max_attempts,
                "preview url not ready"
            );
            Ok(PreviewUrl::not_ready())
        }
    }
}
