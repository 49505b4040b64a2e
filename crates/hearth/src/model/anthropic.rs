//! Anthropic Messages API.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{LanguageModel, ModelBlock, ModelError, ModelRequest, ModelStep, ModelToolCall, Usage};
use crate::message::{Message, Part, Role, ToolCallPart, ToolState};
use crate::tools::ToolDefinition;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Client for the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicModel {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    http: reqwest::Client,
}

impl fmt::Debug for AnthropicModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnthropicModel")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .finish_non_exhaustive()
    }
}

impl AnthropicModel {
    /// Create a client for `model`. Fails if `api_key` is empty.
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ModelError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ModelError::MissingApiKey {
                provider: "anthropic",
            });
        }
        Ok(Self {
            api_key,
            model: model.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            http: reqwest::Client::new(),
        })
    }

    /// Send requests to a different base URL (a proxy or a test server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Cap on output tokens per step.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ModelError> {
        self.http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    fn body(&self, request: &ModelRequest<'_>) -> Value {
        let mut system = request.system.to_string();
        for message in request.messages.iter().filter(|m| m.role == Role::System) {
            let text = message.text();
            if !text.is_empty() {
                system.push_str("\n\n");
                system.push_str(&text);
            }
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": to_anthropic_messages(request.messages),
        });
        if !system.is_empty() {
            body["system"] = Value::String(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(to_anthropic_tool).collect());
        }
        body
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn step(&self, request: ModelRequest<'_>) -> Result<ModelStep, ModelError> {
        let body = self.body(&request);
        tracing::debug!(
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "anthropic request"
        );

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let payload: Value =
            serde_json::from_str(&text).map_err(|e| ModelError::Decode(e.to_string()))?;
        parse_response(&payload)
    }
}

fn to_anthropic_tool(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

/// Render history as Anthropic `messages`.
///
/// An assistant message is split at tool boundaries: each run of tool calls
/// becomes an assistant turn of `tool_use` blocks followed by a user turn of
/// matching `tool_result` blocks. Reasoning parts and calls that never ran
/// are left out. System messages are not rendered here; their text belongs in
/// the `system` field.
pub fn to_anthropic_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for message in messages {
        match message.role {
            Role::System => {}
            Role::User => {
                let blocks: Vec<Value> = message
                    .parts
                    .iter()
                    .filter_map(|part| match part {
                        Part::Text { text } if !text.is_empty() => {
                            Some(json!({"type": "text", "text": text}))
                        }
                        _ => None,
                    })
                    .collect();
                push_turn(&mut out, "user", blocks);
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                let mut results = Vec::new();
                for part in &message.parts {
                    match part {
                        Part::Text { text } => {
                            if text.is_empty() {
                                continue;
                            }
                            if !results.is_empty() {
                                push_turn(&mut out, "assistant", std::mem::take(&mut blocks));
                                push_turn(&mut out, "user", std::mem::take(&mut results));
                            }
                            blocks.push(json!({"type": "text", "text": text}));
                        }
                        Part::Reasoning { .. } => {}
                        Part::ToolCall(call) => {
                            if !call.state.is_settled() {
                                continue;
                            }
                            // The Messages API only takes object inputs.
                            let input = match call.invocation.input() {
                                input @ Value::Object(_) => input,
                                _ => json!({}),
                            };
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": call.call_id,
                                "name": call.tool_name(),
                                "input": input,
                            }));
                            results.push(tool_result(call));
                        }
                    }
                }
                push_turn(&mut out, "assistant", blocks);
                push_turn(&mut out, "user", results);
            }
        }
    }

    out.into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

/// Append a turn, merging with the previous one when the role repeats.
fn push_turn(out: &mut Vec<(&'static str, Vec<Value>)>, role: &'static str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    match out.last_mut() {
        Some((last_role, content)) if *last_role == role => content.extend(blocks),
        _ => out.push((role, blocks)),
    }
}

fn tool_result(call: &ToolCallPart) -> Value {
    let mut block = Map::new();
    block.insert("type".into(), json!("tool_result"));
    block.insert("tool_use_id".into(), json!(call.call_id));
    if call.state == ToolState::OutputError {
        block.insert(
            "content".into(),
            json!(call.error_text.clone().unwrap_or_default()),
        );
        block.insert("is_error".into(), json!(true));
    } else {
        let content = match &call.output {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        block.insert("content".into(), json!(content));
    }
    Value::Object(block)
}

fn parse_response(payload: &Value) -> Result<ModelStep, ModelError> {
    let content = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::Decode("response missing content".to_string()))?;

    let mut blocks = Vec::with_capacity(content.len());
    for block in content {
        match block.get("type").and_then(Value::as_str).unwrap_or("") {
            "text" => {
                let text = block.get("text").and_then(Value::as_str);
                if let Some(text) = text.filter(|t| !t.is_empty()) {
                    blocks.push(ModelBlock::Text(text.to_string()));
                }
            }
            "thinking" => {
                if let Some(text) = block.get("thinking").and_then(Value::as_str) {
                    blocks.push(ModelBlock::Reasoning(text.to_string()));
                }
            }
            "tool_use" => {
                let id = block.get("id").and_then(Value::as_str);
                let name = block.get("name").and_then(Value::as_str);
                let (Some(id), Some(name)) = (id, name) else {
                    return Err(ModelError::Decode(
                        "tool_use block missing id or name".to_string(),
                    ));
                };
                blocks.push(ModelBlock::ToolCall(ModelToolCall {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: block.get("input").cloned().unwrap_or_else(|| json!({})),
                }));
            }
            other => tracing::debug!(block_type = other, "ignoring response block"),
        }
    }

    let usage = payload.get("usage").map(|usage| Usage {
        input_tokens: usage
            .get("input_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        output_tokens: usage
            .get("output_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0),
    });

    Ok(ModelStep {
        blocks,
        stop_reason: payload
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        usage,
    })
}
