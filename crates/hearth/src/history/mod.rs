//! Conversation history: what the model sees and what the store keeps.
//!
//! - [`prune_for_model`] shrinks the history sent to the model by dropping
//!   superseded write calls, whose inputs carry whole file contents.
//! - [`is_followup`] decides whether the read-before-write gate applies.
//! - [`serialize_message`] / [`deserialize_messages`] convert between
//!   [`Message`](crate::Message) and the project store's row format.
//!
//! Pruning never touches storage. The store always holds the full turn; the
//! model is expected to re-read files rather than trust what it remembers.

mod prune;
mod replay;

pub use prune::{is_followup, prune_for_model};
pub use replay::{StoredMessage, deserialize_messages, serialize_message};
