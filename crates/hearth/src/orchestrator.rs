//! The per-turn tool-calling loop.
//!
//! One call to [`Orchestrator::run_turn`] handles one user message:
//!
//! ```text
//! Idle -> AwaitingModel -> ToolExecution -> AwaitingModel -> ... -> Done
//! ```
//!
//! The history is pruned once at the start of the turn. Every model step sees
//! the pruned history plus the assistant message being built, whose tool-call
//! parts carry the results of earlier steps. The turn ends when a step emits
//! no tool calls, the step cap is reached, or the caller cancels.
//!
//! Tool calls from one step run in emission order. Consecutive calls that only
//! observe the sandbox (`readFile`, `listFiles`, `getPreviewUrl`) are
//! dispatched together; anything that changes the sandbox runs alone.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::files::FileKnowledge;
use crate::history::{deserialize_messages, is_followup, prune_for_model, serialize_message};
use crate::message::{Message, Part, Role, ToolCallPart};
use crate::model::{LanguageModel, ModelBlock, ModelError, ModelRequest, Usage};
use crate::prompt::system_prompt;
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::sidecar::Sidecar;
use crate::store::{ProjectStore, SandboxStatus, StoreError};
use crate::tools::{SandboxTools, ToolInvocation};

/// Default cap on model steps per turn.
pub const DEFAULT_MAX_STEPS: usize = 10;

/// Errors that end a turn.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The request carried no user identity.
    #[error("unauthorized: no user id")]
    Unauthorized,
    /// The request named no project.
    #[error("project id is required")]
    MissingProjectId,
    /// The last message is not from the user.
    #[error("the conversation must end with a user message")]
    MissingUserMessage,
    /// The model provider failed.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Validating the request and preparing history.
    Idle,
    /// Waiting for a model step.
    AwaitingModel,
    /// Running the step's tool calls.
    ToolExecution,
    /// Finished.
    Done,
}

impl LoopState {
    /// Short name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::AwaitingModel => "awaiting_model",
            LoopState::ToolExecution => "tool_execution",
            LoopState::Done => "done",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// The model answered without calling a tool.
    Stop,
    /// The step cap was reached.
    StepLimit,
    /// The caller cancelled the turn.
    Cancelled,
}

/// Progress published while a turn runs.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A model step is starting (1-based).
    StepStarted {
        /// Step number.
        step: usize,
    },
    /// The model produced reasoning.
    Reasoning {
        /// Reasoning text.
        text: String,
    },
    /// The model produced visible text.
    Text {
        /// The text.
        text: String,
    },
    /// The model called a tool.
    ToolCall {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool: String,
        /// Tool input.
        input: Value,
    },
    /// A tool call finished.
    ToolResult {
        /// Call id.
        call_id: String,
        /// Tool name.
        tool: String,
        /// Output, on success.
        output: Option<Value>,
        /// Error text, on failure.
        error: Option<String>,
    },
    /// The turn ended.
    Finished {
        /// Why.
        reason: FinishReason,
        /// Model steps taken.
        steps: usize,
    },
}

/// One user turn to run.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Authenticated user.
    pub user_id: String,
    /// Project (and sandbox) id.
    pub project_id: String,
    /// Full history, ending with the new user message.
    pub messages: Vec<Message>,
}

impl TurnRequest {
    /// Create a request.
    pub fn new(
        user_id: impl Into<String>,
        project_id: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            project_id: project_id.into(),
            messages,
        }
    }
}

/// Result of a completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// The assistant message produced this turn.
    pub message: Message,
    /// Model steps taken.
    pub steps: usize,
    /// Why the turn ended.
    pub finish_reason: FinishReason,
    /// Token usage summed over all steps.
    pub usage: Usage,
    /// Whether the turn ran with the read-before-write gate active.
    pub is_followup: bool,
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    model: Arc<dyn LanguageModel>,
    sidecar: Arc<dyn Sidecar>,
    store: Arc<dyn ProjectStore>,
    max_steps: usize,
    preview_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("model", &self.model.name())
            .field("max_steps", &self.max_steps)
            .field("preview_policy", &self.preview_policy)
            .finish_non_exhaustive()
    }
}

impl OrchestratorBuilder {
    /// Cap on model steps per turn.
    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
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

    /// Build the orchestrator.
    pub fn build(self) -> Orchestrator {
        Orchestrator {
            model: self.model,
            sidecar: self.sidecar,
            store: self.store,
            max_steps: self.max_steps,
            preview_policy: self.preview_policy,
            sleeper: self.sleeper,
        }
    }
}

/// Runs conversation turns against a model, a sidecar and a project store.
///
/// An orchestrator holds no per-turn state and can serve many projects
/// concurrently.
pub struct Orchestrator {
    model: Arc<dyn LanguageModel>,
    sidecar: Arc<dyn Sidecar>,
    store: Arc<dyn ProjectStore>,
    max_steps: usize,
    preview_policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("model", &self.model.name())
            .field("max_steps", &self.max_steps)
            .finish_non_exhaustive()
    }
}

/// Optional event channel. A dropped receiver is not an error.
struct Events<'a>(Option<&'a mpsc::UnboundedSender<TurnEvent>>);

impl Events<'_> {
    fn emit(&self, event: TurnEvent) {
        if let Some(tx) = self.0 {
            let _ = tx.send(event);
        }
    }
}

impl Orchestrator {
    /// Start building an orchestrator.
    pub fn builder(
        model: Arc<dyn LanguageModel>,
        sidecar: Arc<dyn Sidecar>,
        store: Arc<dyn ProjectStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            model,
            sidecar,
            store,
            max_steps: DEFAULT_MAX_STEPS,
            preview_policy: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// The step cap.
    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Load a project's stored conversation as messages.
    pub async fn load_history(&self, project_id: &str) -> Result<Vec<Message>, StoreError> {
        let chat = self.store.load_chat(project_id).await?;
        Ok(deserialize_messages(&chat.messages))
    }

    /// Run one turn.
    ///
    /// Progress is published on `events` when given. Cancelling `cancel` stops
    /// the turn before the next model step or tool batch; calls already sent
    /// to the sidecar are allowed to finish. The turn is persisted however it
    /// ends, including when the model fails.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: &CancellationToken,
        events: Option<&mpsc::UnboundedSender<TurnEvent>>,
    ) -> Result<TurnOutcome, TurnError> {
        let events = Events(events);
        let mut state = LoopState::Idle;
        let user_message = validate(&request)?;
        let project_id = request.project_id.as_str();

        let history = prune_for_model(&request.messages);
        let followup = is_followup(&history);
        let sandbox_status = if followup {
            self.probe_sandbox(project_id).await
        } else {
            None
        };
        let system = system_prompt(followup, sandbox_status);

        let tools = SandboxTools::builder(project_id, Arc::clone(&self.sidecar))
            .followup(followup)
            .preview_policy(self.preview_policy)
            .sleeper(Arc::clone(&self.sleeper))
            .build();
        let definitions = tools.definitions();
        let files = Mutex::new(FileKnowledge::new());

        tracing::info!(
            project_id,
            followup,
            messages = request.messages.len(),
            pruned = history.len(),
            "turn started"
        );

        let mut assistant = Message::new(Role::Assistant, Vec::new());
        let mut usage = Usage::default();
        let mut steps = 0;

        let finish_reason = 'turn: loop {
            if cancel.is_cancelled() {
                break FinishReason::Cancelled;
            }
            if steps >= self.max_steps {
                tracing::warn!(project_id, steps, "step limit reached");
                break FinishReason::StepLimit;
            }
            steps += 1;
            transition(&mut state, LoopState::AwaitingModel, project_id, steps);
            events.emit(TurnEvent::StepStarted { step: steps });

            let mut view = history.clone();
            if !assistant.is_empty() {
                view.push(assistant.clone());
            }
            let step = match self
                .model
                .step(ModelRequest {
                    system: &system,
                    messages: &view,
                    tools: &definitions,
                })
                .await
            {
                Ok(step) => step,
                Err(err) => {
                    tracing::error!(project_id, step = steps, error = %err, "model step failed");
                    self.persist(&request, user_message, &assistant).await;
                    return Err(err.into());
                }
            };
            if let Some(step_usage) = step.usage {
                usage.input_tokens += step_usage.input_tokens;
                usage.output_tokens += step_usage.output_tokens;
            }

            let mut pending = Vec::new();
            for block in step.blocks {
                match block {
                    ModelBlock::Reasoning(text) => {
                        events.emit(TurnEvent::Reasoning { text: text.clone() });
                        assistant.parts.push(Part::reasoning(text));
                    }
                    ModelBlock::Text(text) => {
                        events.emit(TurnEvent::Text { text: text.clone() });
                        assistant.parts.push(Part::text(text));
                    }
                    ModelBlock::ToolCall(call) => {
                        let invocation = ToolInvocation::decode(&call.name, &call.input);
                        events.emit(TurnEvent::ToolCall {
                            call_id: call.id.clone(),
                            tool: call.name,
                            input: call.input,
                        });
                        pending.push(assistant.parts.len());
                        assistant
                            .parts
                            .push(Part::ToolCall(ToolCallPart::pending(call.id, invocation)));
                    }
                }
            }

            if pending.is_empty() {
                break FinishReason::Stop;
            }

            transition(&mut state, LoopState::ToolExecution, project_id, steps);
            for batch in batches(&assistant.parts, &pending) {
                if cancel.is_cancelled() {
                    break 'turn FinishReason::Cancelled;
                }
                let invocations: Vec<(usize, ToolInvocation)> = batch
                    .iter()
                    .filter_map(|&idx| {
                        assistant.parts[idx]
                            .as_tool_call()
                            .map(|call| (idx, call.invocation.clone()))
                    })
                    .collect();

                let results = futures::future::join_all(
                    invocations
                        .iter()
                        .map(|(_, invocation)| tools.execute(invocation, &files)),
                )
                .await;

                for ((idx, _), result) in invocations.iter().zip(results) {
                    let Some(Part::ToolCall(call)) = assistant.parts.get_mut(*idx) else {
                        continue;
                    };
                    match result {
                        Ok(output) => call.complete(output),
                        Err(err) => {
                            tracing::error!(project_id, tool = call.tool_name(), error = %err, "tool call failed");
                            call.fail(err.to_string());
                        }
                    }
                    events.emit(TurnEvent::ToolResult {
                        call_id: call.call_id.clone(),
                        tool: call.tool_name().to_string(),
                        output: call.output.clone(),
                        error: call.error_text.clone(),
                    });
                }
            }
        };

        transition(&mut state, LoopState::Done, project_id, steps);
        self.persist(&request, user_message, &assistant).await;
        events.emit(TurnEvent::Finished {
            reason: finish_reason,
            steps,
        });
        tracing::info!(project_id, steps, reason = ?finish_reason, "turn finished");

        Ok(TurnOutcome {
            message: assistant,
            steps,
            finish_reason,
            usage,
            is_followup: followup,
        })
    }

    async fn probe_sandbox(&self, project_id: &str) -> Option<SandboxStatus> {
        match self.store.sandbox_status(project_id).await {
            Ok(status) => {
                tracing::debug!(project_id, ?status, "sandbox status");
                Some(status)
            }
            Err(err) => {
                tracing::warn!(project_id, error = %err, "sandbox status probe failed");
                None
            }
        }
    }

    async fn persist(&self, request: &TurnRequest, user: &Message, assistant: &Message) {
        let mut rows = vec![serialize_message(user)];
        if !assistant.is_empty() {
            rows.push(serialize_message(assistant));
        }
        if let Err(err) = self
            .store
            .save_messages(&request.project_id, &request.user_id, &rows)
            .await
        {
            tracing::error!(
                project_id = %request.project_id,
                error = %err,
                "failed to persist turn"
            );
        }
    }
}

fn validate(request: &TurnRequest) -> Result<&Message, TurnError> {
    if request.user_id.trim().is_empty() {
        return Err(TurnError::Unauthorized);
    }
    if request.project_id.trim().is_empty() {
        return Err(TurnError::MissingProjectId);
    }
    match request.messages.last() {
        Some(message) if message.role == Role::User => Ok(message),
        _ => Err(TurnError::MissingUserMessage),
    }
}

fn transition(state: &mut LoopState, next: LoopState, project_id: &str, step: usize) {
    tracing::debug!(project_id, step, from = %state, to = %next, "loop state");
    *state = next;
}

/// Group pending call indices into dispatch batches.
fn batches(parts: &[Part], pending: &[usize]) -> Vec<Vec<usize>> {
    let mut out: Vec<Vec<usize>> = Vec::new();
    let mut open_concurrent = false;
    for &idx in pending {
        let concurrent = parts[idx]
            .as_tool_call()
            .is_some_and(|call| call.invocation.is_concurrent_safe());
        match out.last_mut() {
            Some(batch) if concurrent && open_concurrent => batch.push(idx),
            _ => out.push(vec![idx]),
        }
        open_concurrent = concurrent;
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn call(name: &str) -> Part {
        let input = match name {
            "readFile" => serde_json::json!({"filePath": "/app/a"}),
            "writeFile" => serde_json::json!({"filePath": "/app/a", "content": ""}),
            "runCommand" => serde_json::json!({"command": "ls"}),
            _ => serde_json::json!({}),
        };
        Part::ToolCall(ToolCallPart::pending(
            name,
            ToolInvocation::decode(name, &input),
        ))
    }

    #[test]
    fn test_batches_group_consecutive_reads() {
        let parts = vec![
            Part::text("start"),
            call("listFiles"),
            call("readFile"),
            call("writeFile"),
            call("readFile"),
            call("getPreviewUrl"),
            call("runCommand"),
            call("createSandbox"),
        ];
        let pending: Vec<usize> = (1..parts.len()).collect();
        assert_eq!(
            batches(&parts, &pending),
            vec![vec![1, 2], vec![3], vec![4, 5], vec![6], vec![7]]
        );
    }

    #[test]
    fn test_validation_order() {
        let empty_user = TurnRequest::new("", "p1", vec![Message::user("hi")]);
        assert!(matches!(validate(&empty_user), Err(TurnError::Unauthorized)));

        let no_project = TurnRequest::new("u1", " ", vec![Message::user("hi")]);
        assert!(matches!(validate(&no_project), Err(TurnError::MissingProjectId)));

        let no_user = TurnRequest::new(
            "u1",
            "p1",
            vec![Message::new(Role::Assistant, vec![Part::text("hello")])],
        );
        assert!(matches!(validate(&no_user), Err(TurnError::MissingUserMessage)));
        let empty = TurnRequest::new("u1", "p1", Vec::new());
        assert!(matches!(validate(&empty), Err(TurnError::MissingUserMessage)));
    }

    #[test]
    fn test_loop_state_names() {
        assert_eq!(LoopState::AwaitingModel.to_string(), "awaiting_model");
        assert_eq!(LoopState::Done.as_str(), "done");
    }
}
