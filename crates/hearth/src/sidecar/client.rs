//! HTTP implementation of [`Sidecar`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::types::{
    ListFilesRequest, ReadFileRequest, RunCommandRequest, SandboxIdRequest, WriteFilesRequest,
};
use super::{
    CreateAck, FileContent, FileListing, PreviewUrl, RunOutput, Sidecar, SidecarError, WriteAck,
};

const CREATE: &str = "/sandbox/create";
const WRITE_FILES: &str = "/sandbox/write-files";
const LIST_FILES: &str = "/sandbox/list-files";
const READ_FILE: &str = "/sandbox/read-file";
const RUN_COMMAND: &str = "/sandbox/run-command";
const TUNNEL_URL: &str = "/sandbox/tunnel-url";
const TERMINATE: &str = "/sandbox/terminate";

/// Sidecar client speaking JSON over HTTP.
#[derive(Clone)]
pub struct SidecarClient {
    base_url: String,
    http: reqwest::Client,
}

impl fmt::Debug for SidecarClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SidecarClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SidecarClient {
    /// Create a client for the sidecar at `base_url` (e.g. `http://localhost:4000`).
    ///
    /// `timeout` bounds every request. Foreground commands such as
    /// `npm install` block for their whole runtime, so keep it generous.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SidecarError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| SidecarError::Transport {
                endpoint: "client",
                source,
            })?;
        Ok(Self::with_http(base_url, http))
    }

    /// Create a client around an existing `reqwest::Client`.
    pub fn with_http(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    /// The base URL requests are sent to.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, T>(&self, endpoint: &'static str, body: &B) -> Result<T, SidecarError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned + Send,
    {
        tracing::debug!(endpoint, "sidecar request");
        let response = self
            .http
            .post(format!("{}{}", self.base_url, endpoint))
            .json(body)
            .send()
            .await
            .map_err(|source| {
                tracing::error!(endpoint, error = %source, "sidecar request failed");
                SidecarError::Transport { endpoint, source }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|source| SidecarError::Transport { endpoint, source })?;

        if !status.is_success() {
            tracing::error!(endpoint, status = status.as_u16(), body = %text, "sidecar returned error");
            return Err(SidecarError::Status {
                endpoint,
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| SidecarError::Decode {
            endpoint,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Sidecar for SidecarClient {
    async fn create(&self, sandbox_id: &str) -> Result<CreateAck, SidecarError> {
        self.post(CREATE, &SandboxIdRequest { sandbox_id }).await
    }

    async fn write_files(
        &self,
        sandbox_id: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<WriteAck, SidecarError> {
        self.post(WRITE_FILES, &WriteFilesRequest { sandbox_id, files })
            .await
    }

    async fn list_files(&self, sandbox_id: &str, path: &str) -> Result<FileListing, SidecarError> {
        self.post(LIST_FILES, &ListFilesRequest { sandbox_id, path })
            .await
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<FileContent, SidecarError> {
        self.post(
            READ_FILE,
            &ReadFileRequest {
                sandbox_id,
                file_path: path,
            },
        )
        .await
    }

    async fn run_command(
        &self,
        sandbox_id: &str,
        command: &str,
        background: bool,
    ) -> Result<RunOutput, SidecarError> {
        self.post(
            RUN_COMMAND,
            &RunCommandRequest {
                sandbox_id,
                command,
                background,
            },
        )
        .await
    }

    async fn tunnel_url(&self, sandbox_id: &str) -> Result<PreviewUrl, SidecarError> {
        let raw: TunnelResponse = self.post(TUNNEL_URL, &SandboxIdRequest { sandbox_id }).await?;
        // Readiness is decided by the URL itself; the status string is advisory.
        Ok(match raw.preview_url {
            Some(url) if !url.is_empty() => PreviewUrl::ready(url),
            _ => PreviewUrl::not_ready(),
        })
    }

    async fn terminate(&self, sandbox_id: &str) -> Result<(), SidecarError> {
        let _: serde_json::Value = self.post(TERMINATE, &SandboxIdRequest { sandbox_id }).await?;
        Ok(())
    }
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TunnelResponse {
    #[serde(default)]
    preview_url: Option<String>,
}
