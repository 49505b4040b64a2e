//! Agent-callable tools bound to one project's sandbox.
//!
//! This module provides:
//!
//! - [`ToolDefinition`] - A tool's schema (name, description, JSON Schema parameters)
//! - [`ToolInvocation`] - A decoded tool call, one variant per tool
//! - [`SandboxTools`] - Executes invocations against the sidecar, consulting
//!   the turn's [`FileKnowledge`]
//!
//! The sandbox id is injected when the tools are built; the model never
//! supplies it, so it cannot target the wrong sandbox.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::files::{FileKnowledge, WriteDecision};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::sidecar::{self, Sidecar, SidecarError};

/// `createSandbox`
pub const CREATE_SANDBOX: &str = "createSandbox";
/// `writeFile`
pub const WRITE_FILE: &str = "writeFile";
/// `listFiles`
pub const LIST_FILES: &str = "listFiles";
/// `readFile`
pub const READ_FILE: &str = "readFile";
/// `runCommand`
pub const RUN_COMMAND: &str = "runCommand";
/// `getPreviewUrl`
pub const GET_PREVIEW_URL: &str = "getPreviewUrl";

/// Tools whose calls carry whole file contents. History pruning keeps only
/// the most recent call of each.
pub const WRITE_TOOLS: &[&str] = &[WRITE_FILE];

const DEFAULT_LIST_PATH: &str = "/app";

/// Full definition of a tool including its parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique identifier).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's parameters.
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Create a tool definition with no parameters.
    pub fn no_params(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(
            name,
            description,
            json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        )
    }
}

/// Errors from executing a tool. The loop turns these into `output-error`
/// parts so the model can see what went wrong.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The model asked for a tool that does not exist.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// The input did not match the tool's schema.
    #[error("invalid input for {tool}: {message}")]
    InvalidInput {
        /// Tool name.
        tool: String,
        /// What was wrong.
        message: String,
    },
    /// The sidecar call failed.
    #[error(transparent)]
    Sidecar(#[from] SidecarError),
    /// The sidecar result could not be encoded for the model.
    #[error("failed to encode tool result: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WriteFileInput {
    file_path: String,
    content: String,
}

#[derive(Deserialize)]
struct ListFilesInput {
    #[serde(default = "default_list_path")]
    path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileInput {
    file_path: String,
}

#[derive(Deserialize)]
struct RunCommandInput {
    command: String,
    #[serde(default)]
    background: bool,
}

fn default_list_path() -> String {
    DEFAULT_LIST_PATH.to_string()
}

/// A decoded tool call.
///
/// Decoding never fails: a name this crate does not know, or input that does
/// not fit the named tool, becomes [`ToolInvocation::Unknown`] with the raw
/// name and input preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    /// Create or restore the project sandbox.
    CreateSandbox,
    /// Write one file.
    WriteFile {
        /// Absolute path inside the sandbox.
        file_path: String,
        /// Full file contents.
        content: String,
    },
    /// List files under a directory.
    ListFiles {
        /// Directory to list.
        path: String,
    },
    /// Read one file.
    ReadFile {
        /// Absolute path inside the sandbox.
        file_path: String,
    },
    /// Run a shell command.
    RunCommand {
        /// The command line.
        command: String,
        /// Return as soon as the process starts.
        background: bool,
    },
    /// Look up the preview URL.
    GetPreviewUrl,
    /// A call that could not be decoded.
    Unknown {
        /// Tool name as given.
        name: String,
        /// Input as given.
        input: Value,
    },
}

impl ToolInvocation {
    /// Decode a call, falling back to [`ToolInvocation::Unknown`].
    pub fn decode(name: &str, input: &Value) -> Self {
        Self::try_decode(name, input).unwrap_or_else(|_| ToolInvocation::Unknown {
            name: name.to_string(),
            input: input.clone(),
        })
    }

    /// Decode a call, reporting why it does not fit.
    pub fn try_decode(name: &str, input: &Value) -> Result<Self, ToolError> {
        fn parse<T: serde::de::DeserializeOwned>(name: &str, input: &Value) -> Result<T, ToolError> {
            serde_json::from_value(input.clone()).map_err(|e| ToolError::InvalidInput {
                tool: name.to_string(),
                message: e.to_string(),
            })
        }

        match name {
            CREATE_SANDBOX => Ok(ToolInvocation::CreateSandbox),
            GET_PREVIEW_URL => Ok(ToolInvocation::GetPreviewUrl),
            WRITE_FILE => {
                let WriteFileInput { file_path, content } = parse(name, input)?;
                Ok(ToolInvocation::WriteFile { file_path, content })
            }
            LIST_FILES => {
                // The model may omit the input object entirely.
                let input = if input.is_null() { &json!({}) } else { input };
                let ListFilesInput { path } = parse(name, input)?;
                Ok(ToolInvocation::ListFiles { path })
            }
            READ_FILE => {
                let ReadFileInput { file_path } = parse(name, input)?;
                Ok(ToolInvocation::ReadFile { file_path })
            }
            RUN_COMMAND => {
                let RunCommandInput {
                    command,
                    background,
                } = parse(name, input)?;
                Ok(ToolInvocation::RunCommand {
                    command,
                    background,
                })
            }
            _ => Err(ToolError::UnknownTool(name.to_string())),
        }
    }

    /// The tool name as the model sees it.
    pub fn name(&self) -> &str {
        match self {
            ToolInvocation::CreateSandbox => CREATE_SANDBOX,
            ToolInvocation::WriteFile { .. } => WRITE_FILE,
            ToolInvocation::ListFiles { .. } => LIST_FILES,
            ToolInvocation::ReadFile { .. } => READ_FILE,
            ToolInvocation::RunCommand { .. } => RUN_COMMAND,
            ToolInvocation::GetPreviewUrl => GET_PREVIEW_URL,
            ToolInvocation::Unknown { name, .. } => name,
        }
    }

    /// The input in the shape the model sent it.
    pub fn input(&self) -> Value {
        match self {
            ToolInvocation::CreateSandbox | ToolInvocation::GetPreviewUrl => json!({}),
            ToolInvocation::WriteFile { file_path, content } => {
                json!({"filePath": file_path, "content": content})
            }
            ToolInvocation::ListFiles { path } => json!({"path": path}),
            ToolInvocation::ReadFile { file_path } => json!({"filePath": file_path}),
            ToolInvocation::RunCommand {
                command,
                background,
            } => json!({"command": command, "background": background}),
            ToolInvocation::Unknown { input, .. } => input.clone(),
        }
    }

    /// Whether this call belongs to a write-class tool.
    ///
    /// Classified by name, so a write whose input failed to decode still
    /// counts.
    pub fn is_write(&self) -> bool {
        WRITE_TOOLS.contains(&self.name())
    }

    /// Whether this call may run alongside its neighbours in the same step.
    ///
    /// Reads, listings and preview lookups only grow the file knowledge sets
    /// (or leave them alone), so their relative order does not matter. Writes,
    /// commands and sandbox creation have ordering-sensitive side effects.
    pub fn is_concurrent_safe(&self) -> bool {
        matches!(
            self,
            ToolInvocation::ReadFile { .. }
                | ToolInvocation::ListFiles { .. }
                | ToolInvocation::GetPreviewUrl
        )
    }
}

/// The full tool set, as declared to the model.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::no_params(
            CREATE_SANDBOX,
            "Create the project's sandbox (Node.js 20). Call this before writing files or \
             running commands. If the sandbox expired, this recreates it and restores files \
             from the last snapshot; installed dependencies are not restored.",
        ),
        ToolDefinition::new(
            WRITE_FILE,
            "Write a single file to the sandbox filesystem, replacing it if it exists.",
            json!({
                "type": "object",
                "properties": {
                    "filePath": {
                        "type": "string",
                        "description": "Absolute path within the sandbox (e.g. /app/package.json)"
                    },
                    "content": {
                        "type": "string",
                        "description": "The full file content to write"
                    }
                },
                "required": ["filePath", "content"]
            }),
        ),
        ToolDefinition::new(
            LIST_FILES,
            "List files in the sandbox. Use this to see the project structure before reading \
             or editing files.",
            json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory path to list (default: /app)",
                        "default": DEFAULT_LIST_PATH
                    }
                },
                "required": []
            }),
        ),
        ToolDefinition::new(
            READ_FILE,
            "Read a file from the sandbox. Use this to understand existing code before editing it.",
            json!({
                "type": "object",
                "properties": {
                    "filePath": {
                        "type": "string",
                        "description": "Absolute path of the file to read (e.g. /app/src/app/page.tsx)"
                    }
                },
                "required": ["filePath"]
            }),
        ),
        ToolDefinition::new(
            RUN_COMMAND,
            "Execute a shell command in the sandbox. Use background=true for long-running \
             processes such as dev servers.",
            json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The shell command to run (e.g. 'npm install')"
                    },
                    "background": {
                        "type": "boolean",
                        "description": "Start the command in the background and return immediately.",
                        "default": false
                    }
                },
                "required": ["command"]
            }),
        ),
        ToolDefinition::no_params(
            GET_PREVIEW_URL,
            "Get the public URL of the app running on port 3000. The tunnel may need a few \
             seconds after the dev server starts.",
        ),
    ]
}

/// Builder for [`SandboxTools`].
pub struct SandboxToolsBuilder {
    sandbox_id: String,
    sidecar: Arc<dyn Sidecar>,
    is_followup: bool,
    preview_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for SandboxToolsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxToolsBuilder")
            .field("sandbox_id", &self.sandbox_id)
            .field("is_followup", &self.is_followup)
            .field("preview_policy", &self.preview_policy)
            .finish_non_exhaustive()
    }
}

impl SandboxToolsBuilder {
    /// Whether this turn follows an earlier assistant turn. Enables the
    /// read-before-write gate.
    pub fn followup(mut self, is_followup: bool) -> Self {
        self.is_followup = is_followup;
        self
    }

    /// Polling policy for `getPreviewUrl`.
    pub fn preview_policy(mut self, policy: RetryPolicy) -> Self {
        self.preview_policy = policy;
        self
    }

    /// Sleeper used between preview polls.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Build the tool set.
    pub fn build(self) -> SandboxTools {
        SandboxTools {
            sandbox_id: self.sandbox_id,
            sidecar: self.sidecar,
            is_followup: self.is_followup,
            preview_policy: self.preview_policy,
            sleeper: self.sleeper,
        }
    }
}

/// The tool set for one turn of one project.
pub struct SandboxTools {
    sandbox_id: String,
    sidecar: Arc<dyn Sidecar>,
    is_followup: bool,
    preview_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for SandboxTools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxTools")
            .field("sandbox_id", &self.sandbox_id)
            .field("is_followup", &self.is_followup)
            .finish_non_exhaustive()
    }
}

impl SandboxTools {
    /// Start building tools for `sandbox_id` (the project id).
    pub fn builder(sandbox_id: impl Into<String>, sidecar: Arc<dyn Sidecar>) -> SandboxToolsBuilder {
        SandboxToolsBuilder {
            sandbox_id: sandbox_id.into(),
            sidecar,
            is_followup: false,
            preview_policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// The sandbox these tools act on.
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Whether the read-before-write gate is active.
    pub fn is_followup(&self) -> bool {
        self.is_followup
    }

    /// Definitions to declare to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        tool_definitions()
    }

    /// Execute one call.
    ///
    /// A gated write is not an error: it returns `{"error": ...}` so the
    /// model can read the file and try again within the same turn.
    pub async fn execute(
        &self,
        invocation: &ToolInvocation,
        files: &Mutex<FileKnowledge>,
    ) -> Result<Value, ToolError> {
        let id = self.sandbox_id.as_str();
        let tool = invocation.name();
        tracing::info!(project_id = id, tool, "tool call");

        let result = match invocation {
            ToolInvocation::CreateSandbox => {
                let ack = self.sidecar.create(id).await?;
                if ack.restored() {
                    tracing::info!(project_id = id, files = ?ack.files_restored, "sandbox restored from snapshot");
                }
                serde_json::to_value(ack)?
            }
            ToolInvocation::WriteFile { file_path, content } => {
                let decision = lock(files).may_write(file_path, self.is_followup);
                if let WriteDecision::Deny(reason) = decision {
                    tracing::warn!(project_id = id, path = %file_path, "write blocked, file not read");
                    return Ok(json!({ "error": reason }));
                }
                tracing::debug!(project_id = id, path = %file_path, chars = content.len(), "writing file");
                let files_to_write = BTreeMap::from([(file_path.clone(), content.clone())]);
                let ack = self.sidecar.write_files(id, &files_to_write).await?;
                lock(files).observe_written(file_path.clone());
                serde_json::to_value(ack)?
            }
            ToolInvocation::ListFiles { path } => {
                let listing = self.sidecar.list_files(id, path).await?;
                lock(files).observe_listed(listing.files.iter().cloned());
                tracing::debug!(project_id = id, path = %path, count = listing.files.len(), "listed files");
                serde_json::to_value(listing)?
            }
            ToolInvocation::ReadFile { file_path } => {
                // An attempt is enough: the model has acknowledged the path
                // even if it turns out not to exist.
                lock(files).observe_read_attempt(file_path.clone());
                let content = self.sidecar.read_file(id, file_path).await?;
                if content.is_missing() {
                    tracing::debug!(project_id = id, path = %file_path, "file not found");
                }
                serde_json::to_value(content)?
            }
            ToolInvocation::RunCommand {
                command,
                background,
            } => {
                let output = self.sidecar.run_command(id, command, *background).await?;
                if let Some(code) = output.exit_code() {
                    tracing::debug!(project_id = id, command = %command, exit_code = code, "command finished");
                }
                serde_json::to_value(output)?
            }
            ToolInvocation::GetPreviewUrl => {
                let preview = sidecar::get_preview_url(
                    self.sidecar.as_ref(),
                    id,
                    &self.preview_policy,
                    self.sleeper.as_ref(),
                )
                .await?;
                serde_json::to_value(preview)?
            }
            ToolInvocation::Unknown { name, input } => {
                return Err(match ToolInvocation::try_decode(name, input) {
                    Err(err) => err,
                    Ok(_) => ToolError::UnknownTool(name.clone()),
                });
            }
        };

        tracing::info!(project_id = id, tool, "tool call done");
        Ok(result)
    }
}

fn lock(files: &Mutex<FileKnowledge>) -> MutexGuard<'_, FileKnowledge> {
    files.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_tools() {
        assert_eq!(
            ToolInvocation::decode(WRITE_FILE, &json!({"filePath": "/app/a.ts", "content": "x"})),
            ToolInvocation::WriteFile {
                file_path: "/app/a.ts".into(),
                content: "x".into()
            }
        );
        assert_eq!(
            ToolInvocation::decode(LIST_FILES, &json!({})),
            ToolInvocation::ListFiles {
                path: "/app".into()
            }
        );
        assert_eq!(
            ToolInvocation::decode(LIST_FILES, &Value::Null),
            ToolInvocation::ListFiles {
                path: "/app".into()
            }
        );
        assert_eq!(
            ToolInvocation::decode(RUN_COMMAND, &json!({"command": "npm install"})),
            ToolInvocation::RunCommand {
                command: "npm install".into(),
                background: false
            }
        );
        assert_eq!(
            ToolInvocation::decode(CREATE_SANDBOX, &json!({})),
            ToolInvocation::CreateSandbox
        );
    }

    #[test]
    fn test_decode_falls_back_to_unknown() {
        let bad = ToolInvocation::decode(WRITE_FILE, &json!({"path": "/app/a.ts"}));
        assert_eq!(bad.name(), WRITE_FILE);
        assert!(matches!(bad, ToolInvocation::Unknown { .. }));
        assert!(bad.is_write());

        let unknown = ToolInvocation::decode("deploy", &json!({"target": "prod"}));
        assert_eq!(unknown.name(), "deploy");
        assert_eq!(unknown.input(), json!({"target": "prod"}));
    }

    #[test]
    fn test_try_decode_reports_reason() {
        let err = ToolInvocation::try_decode(READ_FILE, &json!({})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput { ref tool, .. } if tool == READ_FILE));
        let err = ToolInvocation::try_decode("nope", &json!({})).unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(ref name) if name == "nope"));
    }

    #[test]
    fn test_input_matches_schema_field_names() {
        let call = ToolInvocation::RunCommand {
            command: "npm run dev".into(),
            background: true,
        };
        assert_eq!(
            ToolInvocation::decode(call.name(), &call.input()),
            call
        );
    }

    #[test]
    fn test_definitions_cover_every_tool() {
        let names: Vec<_> = tool_definitions().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                CREATE_SANDBOX,
                WRITE_FILE,
                LIST_FILES,
                READ_FILE,
                RUN_COMMAND,
                GET_PREVIEW_URL
            ]
        );
    }

    #[test]
    fn test_concurrency_classes() {
        assert!(ToolInvocation::GetPreviewUrl.is_concurrent_safe());
        assert!(
            ToolInvocation::ReadFile {
                file_path: "/app/a".into()
            }
            .is_concurrent_safe()
        );
        assert!(!ToolInvocation::CreateSandbox.is_concurrent_safe());
        assert!(
            !ToolInvocation::WriteFile {
                file_path: "/app/a".into(),
                content: String::new()
            }
            .is_concurrent_safe()
        );
    }
}
