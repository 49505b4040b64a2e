//! Language model abstraction.
//!
//! The orchestration loop drives the model one step at a time: each
//! [`LanguageModel::step`] call sends the system instructions, the history so
//! far and the tool definitions, and returns what the model produced in that
//! step. Executing tool calls and deciding whether to continue is the loop's
//! job, not the model's.

mod anthropic;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use anthropic::{AnthropicModel, to_anthropic_messages};

use crate::message::Message;
use crate::tools::ToolDefinition;

/// Errors from a model provider.
#[derive(Debug, Error)]
pub enum ModelError {
    /// No API key was configured.
    #[error("no API key configured for {provider}")]
    MissingApiKey {
        /// Provider name.
        provider: &'static str,
    },
    /// The request never produced a response.
    #[error("model request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The provider answered with a non-2xx status.
    #[error("model provider returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, as text.
        body: String,
    },
    /// The response body did not match the expected shape.
    #[error("unexpected model response: {0}")]
    Decode(String),
}

/// Everything the model sees in one step.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    /// System instructions.
    pub system: &'a str,
    /// Conversation so far, already pruned.
    pub messages: &'a [Message],
    /// Tools the model may call.
    pub tools: &'a [ToolDefinition],
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelToolCall {
    /// Provider-assigned call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Raw input object.
    pub input: Value,
}

/// One piece of model output, in the order it was produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelBlock {
    /// Reasoning text.
    Reasoning(String),
    /// Visible text.
    Text(String),
    /// A tool call.
    ToolCall(ModelToolCall),
}

/// Token accounting for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
}

/// The output of one model step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelStep {
    /// Output blocks in emission order.
    pub blocks: Vec<ModelBlock>,
    /// Provider stop reason, e.g. `end_turn` or `tool_use`.
    pub stop_reason: Option<String>,
    /// Token usage, if reported.
    pub usage: Option<Usage>,
}

impl ModelStep {
    /// A step holding only text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ModelBlock::Text(text.into())],
            stop_reason: Some("end_turn".to_string()),
            usage: None,
        }
    }

    /// Tool calls in this step, in emission order.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ModelToolCall> {
        self.blocks.iter().filter_map(|block| match block {
            ModelBlock::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    /// Whether the model asked for any tool.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }
}

/// A model that can take one step of a conversation.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier, for logging.
    fn name(&self) -> &str;

    /// Run one step.
    async fn step(&self, request: ModelRequest<'_>) -> Result<ModelStep, ModelError>;
}

#[async_trait]
impl<M: LanguageModel + ?Sized> LanguageModel for Arc<M> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn step(&self, request: ModelRequest<'_>) -> Result<ModelStep, ModelError> {
        (**self).step(request).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_tool_calls_in_order() {
        let step = ModelStep {
            blocks: vec![
                ModelBlock::Text("Reading first.".into()),
                ModelBlock::ToolCall(ModelToolCall {
                    id: "a".into(),
                    name: "listFiles".into(),
                    input: json!({}),
                }),
                ModelBlock::ToolCall(ModelToolCall {
                    id: "b".into(),
                    name: "readFile".into(),
                    input: json!({"filePath": "/app/package.json"}),
                }),
            ],
            stop_reason: Some("tool_use".into()),
            usage: None,
        };
        let ids: Vec<_> = step.tool_calls().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(step.has_tool_calls());
        assert!(!ModelStep::text("done").has_tool_calls());
    }
}
