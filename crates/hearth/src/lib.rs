//! Hearth: tool orchestration for a chat-driven app builder
//!
//! A user describes an app; an LLM agent builds it inside a remote sandbox by
//! calling tools (create the sandbox, write files, run commands, fetch the
//! preview URL). Hearth is the layer between the model and the sandbox
//! sidecar: it runs the tool-calling loop, enforces read-before-write on
//! follow-up turns, prunes history for the model and persists each turn.

mod config;
mod files;
pub mod history;
mod message;
pub mod model;
mod orchestrator;
mod prompt;
mod retry;
pub mod sidecar;
mod store;
pub mod tools;

pub use config::{ConfigError, HearthConfig};
pub use files::{FileKnowledge, WriteDecision};
pub use message::{Message, Part, Role, ToolCallPart, ToolState};
pub use orchestrator::{
    DEFAULT_MAX_STEPS, FinishReason, LoopState, Orchestrator, OrchestratorBuilder, TurnError,
    TurnEvent, TurnOutcome, TurnRequest,
};
pub use prompt::system_prompt;
#[cfg(any(test, feature = "test-util"))]
pub use retry::RecordingSleeper;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use store::{
    ChatHistory, ChatInfo, HttpProjectStore, MemoryProjectStore, ProjectStore, SandboxStatus,
    StoreError,
};
