use std::collections::HashSet;

use crate::message::{Message, Part, Role};

/// Build the history to send to the model.
///
/// The final message is passed through untouched. In every earlier message,
/// only the most recent call of each write-class tool is kept; older ones are
/// removed along with their inputs and outputs. Messages left without parts
/// are dropped.
///
/// Pruning an already pruned history returns it unchanged.
pub fn prune_for_model(messages: &[Message]) -> Vec<Message> {
    let Some((last, earlier)) = messages.split_last() else {
        return Vec::new();
    };

    let mut seen: HashSet<&str> = HashSet::new();
    let mut pruned = Vec::with_capacity(messages.len());
    let mut removed = 0usize;

    for message in earlier.iter().rev() {
        let mut parts: Vec<Part> = Vec::with_capacity(message.parts.len());
        for part in message.parts.iter().rev() {
            if let Part::ToolCall(call) = part {
                if call.invocation.is_write() && !seen.insert(call.tool_name()) {
                    removed += 1;
                    continue;
                }
            }
            parts.push(part.clone());
        }
        if parts.is_empty() {
            continue;
        }
        parts.reverse();
        pruned.push(Message::with_id(message.id.clone(), message.role, parts));
    }

    pruned.reverse();
    pruned.push(last.clone());

    if removed > 0 {
        tracing::debug!(
            removed,
            messages_before = messages.len(),
            messages_after = pruned.len(),
            "pruned superseded write calls"
        );
    }
    pruned
}

/// Whether the (pruned) history already holds an assistant reply.
pub fn is_followup(messages: &[Message]) -> bool {
    messages.iter().any(|m| m.role == Role::Assistant)
}
