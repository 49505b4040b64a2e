//! Conversation messages and their parts.
//!
//! A [`Message`] is an ordered list of [`Part`]s. Within an assistant message
//! the order is the temporal order in which the model produced them, and that
//! order is preserved through persistence and replay.
//!
//! Parts serialize to the UI part format shared with the chat front end:
//!
//! ```text
//! {"type": "text", "text": "..."}
//! {"type": "reasoning", "text": "..."}
//! {"type": "tool-writeFile", "toolCallId": "...", "state": "output-available",
//!  "input": {...}, "output": {...}}
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::tools::ToolInvocation;

const TOOL_TYPE_PREFIX: &str = "tool-";

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user.
    User,
    /// The agent.
    Assistant,
    /// Instructions injected by the application.
    System,
}

impl Role {
    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Parse a wire role name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Lifecycle of a tool call part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    /// The model is still streaming the input.
    InputStreaming,
    /// The input is complete; the call has not run yet.
    #[serde(alias = "input-ready")]
    InputAvailable,
    /// The call finished and `output` is set.
    OutputAvailable,
    /// The call failed and `error_text` is set.
    OutputError,
}

impl ToolState {
    /// Whether the call has run, successfully or not.
    pub fn is_settled(&self) -> bool {
        matches!(self, ToolState::OutputAvailable | ToolState::OutputError)
    }
}

/// One tool call and, once it has run, its result.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallPart {
    /// Provider-assigned call id, used to pair the call with its result.
    pub call_id: String,
    /// The decoded call.
    pub invocation: ToolInvocation,
    /// Where the call is in its lifecycle.
    pub state: ToolState,
    /// Result payload, when `state` is `OutputAvailable`.
    pub output: Option<Value>,
    /// Failure description, when `state` is `OutputError`.
    pub error_text: Option<String>,
}

impl ToolCallPart {
    /// A call whose input is complete but which has not run yet.
    pub fn pending(call_id: impl Into<String>, invocation: ToolInvocation) -> Self {
        Self {
            call_id: call_id.into(),
            invocation,
            state: ToolState::InputAvailable,
            output: None,
            error_text: None,
        }
    }

    /// Record a successful result.
    pub fn complete(&mut self, output: Value) {
        self.state = ToolState::OutputAvailable;
        self.output = Some(output);
        self.error_text = None;
    }

    /// Record a failure.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = ToolState::OutputError;
        self.output = None;
        self.error_text = Some(error.into());
    }

    /// Name of the tool being called.
    pub fn tool_name(&self) -> &str {
        self.invocation.name()
    }
}

/// A piece of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Part {
    /// Visible text.
    Text {
        /// The text.
        text: String,
    },
    /// Model reasoning shown separately from the answer.
    Reasoning {
        /// The reasoning text.
        text: String,
    },
    /// A tool call with its result.
    ToolCall(ToolCallPart),
}

impl Part {
    /// A text part.
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// A reasoning part.
    pub fn reasoning(text: impl Into<String>) -> Self {
        Part::Reasoning { text: text.into() }
    }

    /// The tool call, if this is one.
    pub fn as_tool_call(&self) -> Option<&ToolCallPart> {
        match self {
            Part::ToolCall(call) => Some(call),
            _ => None,
        }
    }

    /// Encode in the UI part format.
    pub fn to_ui_json(&self) -> Value {
        match self {
            Part::Text { text } => json!({"type": "text", "text": text}),
            Part::Reasoning { text } => json!({"type": "reasoning", "text": text}),
            Part::ToolCall(call) => {
                let mut obj = Map::new();
                obj.insert(
                    "type".into(),
                    Value::String(format!("{TOOL_TYPE_PREFIX}{}", call.tool_name())),
                );
                obj.insert("toolCallId".into(), Value::String(call.call_id.clone()));
                obj.insert(
                    "state".into(),
                    serde_json::to_value(call.state).unwrap_or(Value::Null),
                );
                obj.insert("input".into(), call.invocation.input());
                if let Some(output) = &call.output {
                    obj.insert("output".into(), output.clone());
                }
                if let Some(error) = &call.error_text {
                    obj.insert("errorText".into(), Value::String(error.clone()));
                }
                Value::Object(obj)
            }
        }
    }

    /// Decode a UI part. Returns `None` for part types this crate does not model.
    pub fn from_ui_json(value: &Value) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        match kind {
            "text" => Some(Part::text(value.get("text")?.as_str()?)),
            "reasoning" => Some(Part::reasoning(value.get("text")?.as_str()?)),
            _ => {
                let name = kind.strip_prefix(TOOL_TYPE_PREFIX)?;
                let call_id = value.get("toolCallId")?.as_str()?.to_string();
                let input = value.get("input").cloned().unwrap_or(Value::Null);
                let state = value
                    .get("state")
                    .and_then(|s| serde_json::from_value(s.clone()).ok())
                    .unwrap_or(ToolState::InputAvailable);
                Some(Part::ToolCall(ToolCallPart {
                    call_id,
                    invocation: ToolInvocation::decode(name, &input),
                    state,
                    output: value.get("output").cloned(),
                    error_text: value
                        .get("errorText")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }))
            }
        }
    }
}

impl Serialize for Part {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_ui_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Part {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Part::from_ui_json(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("unsupported message part: {value}")))
    }
}

/// A conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id; reused when the message is saved again.
    pub id: String,
    /// Author.
    pub role: Role,
    /// Ordered content.
    pub parts: Vec<Part>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            parts,
        }
    }

    /// Create a message with a caller-chosen id.
    pub fn with_id(id: impl Into<String>, role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: id.into(),
            role,
            parts,
        }
    }

    /// A user message holding one text part.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// Whether the message has no parts.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Concatenated text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Iterate over the tool calls in this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallPart> {
        self.parts.iter().filter_map(Part::as_tool_call)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_part_ui_shape() {
        let mut call = ToolCallPart::pending(
            "call_1",
            ToolInvocation::WriteFile {
                file_path: "/app/package.json".into(),
                content: "{}".into(),
            },
        );
        call.complete(json!({"written": ["/app/package.json"]}));

        let value = Part::ToolCall(call).to_ui_json();
        assert_eq!(value["type"], "tool-writeFile");
        assert_eq!(value["toolCallId"], "call_1");
        assert_eq!(value["state"], "output-available");
        assert_eq!(value["input"]["filePath"], "/app/package.json");
        assert_eq!(value["output"]["written"][0], "/app/package.json");
        assert!(value.get("errorText").is_none());
    }

    #[test]
    fn test_input_ready_alias() {
        let part = Part::from_ui_json(&json!({
            "type": "tool-readFile",
            "toolCallId": "c",
            "state": "input-ready",
            "input": {"filePath": "/app/a.ts"}
        }))
        .unwrap();
        let call = part.as_tool_call().unwrap();
        assert_eq!(call.state, ToolState::InputAvailable);
        assert!(!call.state.is_settled());
    }

    #[test]
    fn test_unknown_tool_part_keeps_name() {
        let part = Part::from_ui_json(&json!({
            "type": "tool-deployToVercel",
            "toolCallId": "c",
            "state": "output-error",
            "input": {"team": "x"},
            "errorText": "nope"
        }))
        .unwrap();
        let call = part.as_tool_call().unwrap();
        assert_eq!(call.tool_name(), "deployToVercel");
        assert_eq!(call.invocation.input(), json!({"team": "x"}));
        assert_eq!(call.error_text.as_deref(), Some("nope"));
    }

    #[test]
    fn test_unmodelled_part_types_rejected() {
        assert!(Part::from_ui_json(&json!({"type": "step-start"})).is_none());
        assert!(Part::from_ui_json(&json!({"type": "text"})).is_none());
        assert!(serde_json::from_value::<Part>(json!({"type": "file"})).is_err());
    }

    #[test]
    fn test_message_serde() {
        let msg = Message::with_id(
            "m1",
            Role::User,
            vec![Part::text("build a todo app")],
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"id": "m1", "role": "user", "parts": [{"type": "text", "text": "build a todo app"}]})
        );
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.text(), "build a todo app");
    }
}
