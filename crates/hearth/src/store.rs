//! Project store: where conversation turns and sandbox status live.
//!
//! The store is an external service; this crate talks to it through the
//! [`ProjectStore`] trait. [`HttpProjectStore`] speaks its JSON API and
//! [`MemoryProjectStore`] keeps everything in process for tests and local runs.
//!
//! ```text
//! POST {base}/projects/{id}/chat/messages   {userId, messages: [{id, role, content}]}
//! GET  {base}/projects/{id}/chat            -> {chat, messages: [{id, role, content, createdAt}]}
//! GET  {base}/projects/{id}/sandbox-status  -> {status}
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::StoredMessage;

/// Errors talking to the project store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The request never produced a response.
    #[error("project store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The store answered with a non-2xx status.
    #[error("project store returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },
    /// The response body did not match the expected shape.
    #[error("unexpected project store response: {0}")]
    Decode(String),
    /// The configured base URL cannot carry a project path.
    #[error("invalid project store url: {0}")]
    InvalidUrl(String),
}

/// Lifecycle of a project's sandbox as the store records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// No sandbox has been created.
    #[default]
    Absent,
    /// Creation is in progress.
    Creating,
    /// The sandbox is up.
    Running,
    /// The sandbox timed out; files survive in a snapshot.
    Expired,
    /// The sandbox was terminated.
    Stopped,
    /// The sandbox is in a failed or unrecognised state.
    Error,
}

impl SandboxStatus {
    /// Parse a status string reported by the store.
    pub fn parse(value: &str) -> Self {
        match value {
            "absent" | "" => SandboxStatus::Absent,
            "creating" => SandboxStatus::Creating,
            "running" => SandboxStatus::Running,
            "expired" => SandboxStatus::Expired,
            "stopped" | "terminated" => SandboxStatus::Stopped,
            _ => SandboxStatus::Error,
        }
    }

    /// Whether a follow-up turn has to recreate the sandbox.
    pub fn needs_recreate(&self) -> bool {
        matches!(self, SandboxStatus::Expired | SandboxStatus::Stopped)
    }
}

impl<'de> Deserialize<'de> for SandboxStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.as_deref().map_or(SandboxStatus::Absent, SandboxStatus::parse))
    }
}

/// Chat metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInfo {
    /// Chat id.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Owning user.
    pub user_id: String,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Last update time.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A project's stored conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatHistory {
    /// Chat metadata, absent before the first save.
    #[serde(default)]
    pub chat: Option<ChatInfo>,
    /// Messages, oldest first.
    #[serde(default)]
    pub messages: Vec<StoredMessage>,
}

/// Persistence for conversation turns.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Save messages. A message whose id is already stored replaces it.
    async fn save_messages(
        &self,
        project_id: &str,
        user_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), StoreError>;

    /// Load a project's conversation, oldest message first.
    async fn load_chat(&self, project_id: &str) -> Result<ChatHistory, StoreError>;

    /// Current sandbox status for a project.
    async fn sandbox_status(&self, project_id: &str) -> Result<SandboxStatus, StoreError>;
}

#[async_trait]
impl<S: ProjectStore + ?Sized> ProjectStore for Arc<S> {
    async fn save_messages(
        &self,
        project_id: &str,
        user_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), StoreError> {
        (**self).save_messages(project_id, user_id, messages).await
    }

    async fn load_chat(&self, project_id: &str) -> Result<ChatHistory, StoreError> {
        (**self).load_chat(project_id).await
    }

    async fn sandbox_status(&self, project_id: &str) -> Result<SandboxStatus, StoreError> {
        (**self).sandbox_status(project_id).await
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveMessagesRequest<'a> {
    user_id: &'a str,
    messages: Vec<SaveMessage<'a>>,
}

#[derive(Serialize)]
struct SaveMessage<'a> {
    id: &'a str,
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: SandboxStatus,
}

/// Project store client speaking JSON over HTTP.
#[derive(Clone)]
pub struct HttpProjectStore {
    base_url: String,
    http: reqwest::Client,
}

impl fmt::Debug for HttpProjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpProjectStore")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpProjectStore {
    /// Create a client for the store API at `base_url` (e.g. `http://localhost:4000/api`).
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_http(base_url, http))
    }

    /// Create a client around an existing `reqwest::Client`.
    pub fn with_http(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    /// `{base}/projects/{project_id}/{tail..}`, with every segment percent-encoded.
    fn url(&self, project_id: &str, tail: &[&str]) -> Result<reqwest::Url, StoreError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| StoreError::InvalidUrl(format!("{}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| StoreError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .push("projects")
            .push(project_id)
            .extend(tail);
        Ok(url)
    }

    async fn read_body(response: reqwest::Response) -> Result<String, StoreError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    fn decode<T: DeserializeOwned>(body: &str) -> Result<T, StoreError> {
        serde_json::from_str(body).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ProjectStore for HttpProjectStore {
    async fn save_messages(
        &self,
        project_id: &str,
        user_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), StoreError> {
        let request = SaveMessagesRequest {
            user_id,
            messages: messages
                .iter()
                .map(|m| SaveMessage {
                    id: &m.id,
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
        };
        tracing::debug!(project_id, count = messages.len(), "saving messages");
        let response = self
            .http
            .post(self.url(project_id, &["chat", "messages"])?)
            .json(&request)
            .send()
            .await?;
        Self::read_body(response).await?;
        Ok(())
    }

    async fn load_chat(&self, project_id: &str) -> Result<ChatHistory, StoreError> {
        let response = self
            .http
            .get(self.url(project_id, &["chat"])?)
            .send()
            .await?;
        let body = Self::read_body(response).await?;
        let mut history: ChatHistory = Self::decode(&body)?;
        // Stable sort: rows sharing a timestamp keep the order the store sent.
        history.messages.sort_by_key(|m| m.created_at);
        Ok(history)
    }

    async fn sandbox_status(&self, project_id: &str) -> Result<SandboxStatus, StoreError> {
        let response = self
            .http
            .get(self.url(project_id, &["sandbox-status"])?)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(SandboxStatus::Absent);
        }
        let body = Self::read_body(response).await?;
        let parsed: StatusResponse = Self::decode(&body)?;
        Ok(parsed.status)
    }
}

#[derive(Debug, Default)]
struct ProjectRecord {
    user_id: Option<String>,
    messages: Vec<StoredMessage>,
    status: SandboxStatus,
}

/// In-process store with the same upsert semantics as the HTTP service.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    projects: Mutex<HashMap<String, ProjectRecord>>,
}

impl MemoryProjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sandbox status reported for a project.
    pub fn set_sandbox_status(&self, project_id: &str, status: SandboxStatus) {
        self.lock()
            .entry(project_id.to_string())
            .or_default()
            .status = status;
    }

    /// Messages stored for a project, oldest first.
    pub fn messages(&self, project_id: &str) -> Vec<StoredMessage> {
        self.lock()
            .get(project_id)
            .map(|p| p.messages.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProjectRecord>> {
        self.projects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn save_messages(
        &self,
        project_id: &str,
        user_id: &str,
        messages: &[StoredMessage],
    ) -> Result<(), StoreError> {
        let mut projects = self.lock();
        let record = projects.entry(project_id.to_string()).or_default();
        record.user_id.get_or_insert_with(|| user_id.to_string());
        for message in messages {
            match record.messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => {
                    existing.role = message.role.clone();
                    existing.content = message.content.clone();
                }
                None => {
                    let mut message = message.clone();
                    message.created_at.get_or_insert_with(Utc::now);
                    record.messages.push(message);
                }
            }
        }
        Ok(())
    }

    async fn load_chat(&self, project_id: &str) -> Result<ChatHistory, StoreError> {
        let projects = self.lock();
        let Some(record) = projects.get(project_id) else {
            return Ok(ChatHistory::default());
        };
        let chat = record.user_id.as_ref().map(|user_id| ChatInfo {
            id: project_id.to_string(),
            project_id: project_id.to_string(),
            user_id: user_id.clone(),
            created_at: record.messages.first().and_then(|m| m.created_at),
            updated_at: record.messages.last().and_then(|m| m.created_at),
        });
        Ok(ChatHistory {
            chat,
            messages: record.messages.clone(),
        })
    }

    async fn sandbox_status(&self, project_id: &str) -> Result<SandboxStatus, StoreError> {
        Ok(self
            .lock()
            .get(project_id)
            .map(|p| p.status)
            .unwrap_or_default())
    }
}
