use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::message::{Message, Part, Role, ToolCallPart, ToolState};
use crate::tools::ToolInvocation;

/// A message as the project store keeps it.
///
/// `content` is a JSON string. For user and system messages it holds the UI
/// parts verbatim. For assistant messages it holds flattened model output:
///
/// ```text
/// [{"type": "reasoning", "text": "..."},
///  {"type": "text", "text": "..."},
///  {"type": "tool-call", "toolCallId": "...", "toolName": "writeFile",
///   "args": {...}, "result": {...}, "isError": false}]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Message id.
    pub id: String,
    /// Role name (`user`, `assistant`, `system`).
    pub role: String,
    /// Serialized content.
    pub content: String,
    /// When the store first saw the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Convert a message to its stored form.
pub fn serialize_message(message: &Message) -> StoredMessage {
    let entries: Vec<Value> = match message.role {
        Role::Assistant => message.parts.iter().map(assistant_entry).collect(),
        Role::User | Role::System => message.parts.iter().map(Part::to_ui_json).collect(),
    };
    StoredMessage {
        id: message.id.clone(),
        role: message.role.as_str().to_string(),
        content: Value::Array(entries).to_string(),
        created_at: None,
    }
}

/// Rebuild messages from their stored form, preserving order.
///
/// Content that does not parse as a JSON array of known entries is kept as a
/// single text part holding the raw string. Unknown entries inside an
/// otherwise valid array are skipped and logged. Rows with an unknown role are
/// skipped.
pub fn deserialize_messages(stored: &[StoredMessage]) -> Vec<Message> {
    stored.iter().filter_map(deserialize_one).collect()
}

fn deserialize_one(stored: &StoredMessage) -> Option<Message> {
    let Some(role) = Role::parse(&stored.role) else {
        tracing::warn!(message_id = %stored.id, role = %stored.role, "skipping stored message with unknown role");
        return None;
    };

    let entries = match serde_json::from_str::<Value>(&stored.content) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) | Err(_) => {
            return Some(Message::with_id(
                stored.id.clone(),
                role,
                vec![Part::text(stored.content.clone())],
            ));
        }
    };

    let mut parts = Vec::with_capacity(entries.len());
    for entry in &entries {
        let part = match role {
            Role::Assistant => part_from_entry(entry),
            Role::User | Role::System => Part::from_ui_json(entry),
        };
        match part {
            Some(part) => parts.push(part),
            None => {
                let kind = entry.get("type").and_then(Value::as_str).unwrap_or("<none>");
                tracing::warn!(message_id = %stored.id, kind, "dropping unrecognised stored entry");
            }
        }
    }

    if parts.is_empty() {
        parts.push(Part::text(stored.content.clone()));
    }
    Some(Message::with_id(stored.id.clone(), role, parts))
}

fn assistant_entry(part: &Part) -> Value {
    match part {
        Part::Text { text } => json!({"type": "text", "text": text}),
        Part::Reasoning { text } => json!({"type": "reasoning", "text": text}),
        Part::ToolCall(call) => {
            let mut entry = Map::new();
            entry.insert("type".into(), Value::String("tool-call".into()));
            entry.insert("toolCallId".into(), Value::String(call.call_id.clone()));
            entry.insert("toolName".into(), Value::String(call.tool_name().to_string()));
            entry.insert("args".into(), call.invocation.input());
            match call.state {
                ToolState::OutputAvailable => {
                    entry.insert("result".into(), call.output.clone().unwrap_or(Value::Null));
                }
                ToolState::OutputError => {
                    let error = call.error_text.clone().unwrap_or_default();
                    entry.insert("result".into(), Value::String(error));
                    entry.insert("isError".into(), Value::Bool(true));
                }
                ToolState::InputStreaming | ToolState::InputAvailable => {}
            }
            Value::Object(entry)
        }
    }
}

fn part_from_entry(entry: &Value) -> Option<Part> {
    match entry.get("type")?.as_str()? {
        "text" => Some(Part::text(entry.get("text")?.as_str()?)),
        "reasoning" => Some(Part::reasoning(entry.get("text")?.as_str()?)),
        "tool-call" => {
            let call_id = entry.get("toolCallId")?.as_str()?;
            let name = entry.get("toolName")?.as_str()?;
            let args = entry.get("args").cloned().unwrap_or_else(|| json!({}));
            let mut call = ToolCallPart::pending(call_id, ToolInvocation::decode(name, &args));

            let is_error = entry
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            match entry.get("result") {
                Some(result) if is_error => call.fail(match result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                }),
                Some(result) => call.complete(result.clone()),
                None => {}
            }
            Some(Part::ToolCall(call))
        }
        _ => None,
    }
}
