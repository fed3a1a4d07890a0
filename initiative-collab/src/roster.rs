//! Roster of collaborators currently connected to the document.
//!
//! Built from presence messages the peer sends:
//!
//! | `type`          | effect                                       |
//! |-----------------|----------------------------------------------|
//! | `collaborators` | replace the whole roster                     |
//! | `join`          | add a record unless the session is present   |
//! | `leave`         | remove the record, if any                    |
//! | `cursor`        | replace the cursor of an existing record     |
//!
//! Records keep arrival order so hosts can render a stable list.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a remote editing session.
pub type SessionId = u64;

/// Selection of a remote collaborator.
///
/// Positions are opaque to the client; the editor that produced them
/// knows how to resolve them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: Value,
    pub focus: Value,
}

/// One connected collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorRecord {
    pub session_id: SessionId,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(default = "default_can_write")]
    pub can_write: bool,
    #[serde(default)]
    pub cursor: Option<CursorRange>,
}

fn default_can_write() -> bool {
    true
}

impl CollaboratorRecord {
    pub fn new(session_id: SessionId, display_name: impl Into<String>) -> Self {
        Self {
            session_id,
            display_name: display_name.into(),
            can_write: default_can_write(),
            cursor: None,
        }
    }
}

/// Inbound presence message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RosterEvent {
    Collaborators {
        data: Vec<CollaboratorRecord>,
    },
    Join {
        user: CollaboratorRecord,
    },
    Leave {
        session_id: SessionId,
    },
    Cursor {
        session_id: SessionId,
        #[serde(default)]
        cursor: Option<CursorRange>,
    },
    #[serde(other)]
    Unknown,
}

impl RosterEvent {
    /// Parse a presence payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Authoritative list of connected collaborators.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    records: Vec<CollaboratorRecord>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns `true` if the roster changed.
    ///
    /// A snapshot always counts as a change: it is the peer's way of
    /// telling us to re-render.
    pub fn apply(&mut self, event: RosterEvent) -> bool {
        match event {
            RosterEvent::Collaborators { data } => {
                self.replace(data);
                true
            }
            RosterEvent::Join { user } => self.join(user),
            RosterEvent::Leave { session_id } => self.leave(session_id),
            RosterEvent::Cursor { session_id, cursor } => self.move_cursor(session_id, cursor),
            RosterEvent::Unknown => false,
        }
    }

    /// Replace every record. Duplicate session ids keep their first entry.
    pub fn replace(&mut self, records: Vec<CollaboratorRecord>) {
        self.records.clear();
        for record in records {
            if self.get(record.session_id).is_none() {
                self.records.push(record);
            }
        }
    }

    /// Add a collaborator. Duplicate joins are ignored.
    pub fn join(&mut self, record: CollaboratorRecord) -> bool {
        if self.get(record.session_id).is_some() {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn leave(&mut self, session_id: SessionId) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.session_id != session_id);
        self.records.len() != before
    }

    /// Update the cursor of a known collaborator.
    pub fn move_cursor(&mut self, session_id: SessionId, cursor: Option<CursorRange>) -> bool {
        match self.records.iter_mut().find(|r| r.session_id == session_id) {
            Some(record) if record.cursor != cursor => {
                record.cursor = cursor;
                true
            }
            _ => false,
        }
    }

    /// Forget everyone. Returns `true` if the roster was non-empty.
    pub fn clear(&mut self) -> bool {
        let had_records = !self.records.is_empty();
        self.records.clear();
        had_records
    }

    pub fn get(&self, session_id: SessionId) -> Option<&CollaboratorRecord> {
        self.records.iter().find(|r| r.session_id == session_id)
    }

    pub fn records(&self) -> &[CollaboratorRecord] {
        &self.records
    }

    /// Owned copy of the full roster.
    pub fn snapshot(&self) -> Vec<CollaboratorRecord> {
        self.records.clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
