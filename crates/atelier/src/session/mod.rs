//! Conversational sessions whose replies may be backed by long-running jobs.
//!
//! The [`SessionTaskTracker`] keeps an ordered log of [`Entry`] values for the
//! active session and resolves job-backed replies in place from one shared
//! poll tick.

pub mod backend;
mod tracker;

pub use backend::{ChatReply, HttpChatBackend, LinkedTask, OutgoingMessage, SessionBackend};
pub use tracker::SessionTaskTracker;

use crate::task::TaskArtifact;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    User,
    Assistant,
}

/// `Created → Awaiting → {Resolved | Failed}`; replies without a job go
/// straight from `Created` to `Resolved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryStatus {
    Created,
    Awaiting,
    Resolved,
    Failed,
}

impl EntryStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, EntryStatus::Resolved | EntryStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    /// Local id, unique within the tracker.
    pub id: String,
    pub role: EntryRole,
    pub content: String,
    /// Image sent along with a user entry.
    pub attachment: Option<String>,
    /// The backend's id for this message, once known.
    pub message_id: Option<String>,
    pub linked_task_id: Option<String>,
    pub status: EntryStatus,
    pub artifact: Option<TaskArtifact>,
}

impl Entry {
    pub(crate) fn new(id: String, role: EntryRole, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            attachment: None,
            message_id: None,
            linked_task_id: None,
            status: EntryStatus::Created,
            artifact: None,
        }
    }
}

/// The active conversation. Entries are only ever appended.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub entries: Vec<Entry>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }
}
