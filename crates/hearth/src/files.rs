//! Per-turn file knowledge and the read-before-write gate.
//!
//! After history pruning the model no longer sees the contents of files it
//! wrote in earlier turns. If it rewrites such a file from memory it silently
//! discards whatever the earlier turn put there. [`FileKnowledge`] tracks what
//! the model has learned about the sandbox filesystem during the current turn
//! and refuses writes to files that are known to exist but were never
//! inspected.
//!
//! The gate only applies on follow-up turns, and only to files discovered via
//! `listFiles`. Brand-new files are always writable, and a read attempt (even
//! one that finds nothing) or an earlier write in the same turn unlocks a path.
//!
//! A `FileKnowledge` is created empty when a turn starts and dropped when it
//! ends. It is never persisted or shared between turns.

use std::collections::HashSet;

/// Outcome of a write gate check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteDecision {
    /// The write may proceed.
    Allow,
    /// The write is refused; the reason is meant for the model.
    Deny(String),
}

impl WriteDecision {
    /// Returns true if the write may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, WriteDecision::Allow)
    }

    /// The refusal message, if the write was denied.
    pub fn denial_reason(&self) -> Option<&str> {
        match self {
            WriteDecision::Allow => None,
            WriteDecision::Deny(reason) => Some(reason),
        }
    }
}

/// What the model has learned about the sandbox filesystem this turn.
#[derive(Clone, Debug, Default)]
pub struct FileKnowledge {
    known: HashSet<String>,
    read: HashSet<String>,
    written: HashSet<String>,
}

impl FileKnowledge {
    /// Empty knowledge, as at the start of a turn.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record paths returned by a directory listing.
    pub fn observe_listed<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known.extend(paths.into_iter().map(Into::into));
    }

    /// Record a read attempt, whether or not the file turned out to exist.
    pub fn observe_read_attempt(&mut self, path: impl Into<String>) {
        self.read.insert(path.into());
    }

    /// Record a successful write.
    pub fn observe_written(&mut self, path: impl Into<String>) {
        self.written.insert(path.into());
    }

    /// Check whether the model may write `path`.
    pub fn may_write(&self, path: &str, is_followup: bool) -> WriteDecision {
        if is_followup
            && self.known.contains(path)
            && !self.read.contains(path)
            && !self.written.contains(path)
        {
            WriteDecision::Deny(format!(
                "You must call readFile on \"{path}\" before writing to it. \
                 The file exists in the sandbox but its contents are not in your context."
            ))
        } else {
            WriteDecision::Allow
        }
    }

    /// Whether `path` was discovered by a listing.
    pub fn is_known(&self, path: &str) -> bool {
        self.known.contains(path)
    }

    /// Whether `path` has had a read attempt.
    pub fn was_read(&self, path: &str) -> bool {
        self.read.contains(path)
    }

    /// Whether `path` has been written.
    pub fn was_written(&self, path: &str) -> bool {
        self.written.contains(path)
    }

    /// Number of paths discovered by listings.
    pub fn known_count(&self) -> usize {
        self.known.len()
    }
}
