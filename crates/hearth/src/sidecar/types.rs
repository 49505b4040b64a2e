//! Request and response bodies for the sandbox sidecar HTTP contract.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub(crate) struct SandboxIdRequest<'a> {
    pub sandbox_id: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct WriteFilesRequest<'a> {
    pub sandbox_id: &'a str,
    pub files: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ListFilesRequest<'a> {
    pub sandbox_id: &'a str,
    pub path: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReadFileRequest<'a> {
    pub sandbox_id: &'a str,
    pub file_path: &'a str,
}

#[derive(Debug, Serialize)]
pub(crate) struct RunCommandRequest<'a> {
    pub sandbox_id: &'a str,
    pub command: &'a str,
    pub background: bool,
}

/// Acknowledgement returned by `POST /sandbox/create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAck {
    /// The sandbox id that was created.
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// `created` for a fresh sandbox, `restored` when files came back from a snapshot.
    #[serde(default)]
    pub status: Option<String>,
    /// Number of files restored from the last snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_restored: Option<u64>,
}

impl CreateAck {
    /// Whether files were restored from a snapshot into the new sandbox.
    pub fn restored(&self) -> bool {
        self.status.as_deref() == Some("restored")
    }
}

/// Acknowledgement returned by `POST /sandbox/write-files`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteAck {
    /// Paths the sidecar reports as written.
    #[serde(default)]
    pub written: Vec<String>,
}

/// Listing returned by `POST /sandbox/list-files`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileListing {
    /// Absolute paths of regular files under the requested directory.
    pub files: Vec<String>,
}

/// Result of `POST /sandbox/read-file`.
///
/// A `None` content is the sidecar's not-found indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    /// The path that was read.
    pub file_path: String,
    /// File contents, or `None` when the file could not be read.
    pub content: Option<String>,
    /// Why the read failed, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileContent {
    /// Whether the sidecar reported the file as missing or unreadable.
    pub fn is_missing(&self) -> bool {
        self.content.is_none()
    }
}

/// Result of `POST /sandbox/run-command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunOutput {
    /// A foreground command ran to completion.
    #[serde(rename_all = "camelCase")]
    Completed {
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
        /// Process exit status.
        exit_code: i32,
    },
    /// A background command was launched and left running.
    Started {
        /// Always `started`.
        status: String,
        /// The command that was launched.
        command: String,
    },
}

impl RunOutput {
    /// Exit code of a completed command; `None` for background launches.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RunOutput::Completed { exit_code, .. } => Some(*exit_code),
            RunOutput::Started { .. } => None,
        }
    }
}

/// Readiness of the sandbox preview tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    /// The tunnel is up and `preview_url` is set.
    Ready,
    /// The tunnel has not come up yet.
    NotReady,
}

/// Preview URL lookup result, both for a single request and after polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewUrl {
    /// Public URL of the app on port 3000.
    pub preview_url: Option<String>,
    /// Whether the tunnel is ready.
    pub status: PreviewStatus,
}

impl PreviewUrl {
    /// A not-ready result with no URL.
    pub fn not_ready() -> Self {
        Self {
            preview_url: None,
            status: PreviewStatus::NotReady,
        }
    }

    /// A ready result for `url`.
    pub fn ready(url: impl Into<String>) -> Self {
        Self {
            preview_url: Some(url.into()),
            status: PreviewStatus::Ready,
        }
    }
}
