//! Local presence: the ephemeral key/value state this session publishes.
//!
//! The whole object is sent on every change (never a diff), so a peer
//! that missed earlier messages catches up from the next one.
//!
//! ```text
//! host: set_local_presence({"cursor": …})
//!       │
//!       ▼
//! LocalPresence::merge()  ── unchanged? ──► nothing sent
//!       │ changed
//!       ▼
//! Frame::presence(fields)  ──►  socket (only while connected)
//! ```

use serde_json::{Map, Value};

use crate::protocol::{Frame, ProtocolError};

/// Presence fields owned by the local session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalPresence {
    fields: Map<String, Value>,
}

impl LocalPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `fields` into the presence object.
    ///
    /// Returns `true` if any field changed.
    pub fn merge(&mut self, fields: Map<String, Value>) -> bool {
        let mut changed = false;
        for (key, value) in fields {
            if self.fields.get(&key) != Some(&value) {
                self.fields.insert(key, value);
                changed = true;
            }
        }
        changed
    }

    /// Set a single field. Returns `true` if it changed.
    pub fn set_field(&mut self, key: impl Into<String>, value: Value) -> bool {
        let mut fields = Map::new();
        fields.insert(key.into(), value);
        self.merge(fields)
    }

    /// Drop every field. Returns `true` if there was anything to drop.
    pub fn clear(&mut self) -> bool {
        if self.fields.is_empty() {
            return false;
        }
        self.fields.clear();
        true
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The full presence object as a wire frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Frame::presence(&self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_new_is_empty() {
        let presence = LocalPresence::new();
        assert!(presence.is_empty());
        assert!(presence.fields().is_empty());
    }

    #[test]
    fn test_merge_reports_change() {
        let mut presence = LocalPresence::new();
        assert!(presence.merge(object(json!({ "name": "Ada" }))));
        assert_eq!(presence.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn test_merge_same_value_is_noop() {
        let mut presence = LocalPresence::new();
        presence.merge(object(json!({ "name": "Ada" })));
        assert!(!presence.merge(object(json!({ "name": "Ada" }))));
        assert_eq!(presence.fields().len(), 1);
    }

    #[test]
    fn test_merge_keeps_other_fields() {
        let mut presence = LocalPresence::new();
        presence.merge(object(json!({ "name": "Ada" })));
        presence.set_field("cursor", json!({ "anchor": 1, "focus": 4 }));

        assert_eq!(presence.fields().len(), 2);
        assert_eq!(presence.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn test_clear() {
        let mut presence = LocalPresence::new();
        assert!(!presence.clear());
        presence.set_field("name", json!("Ada"));
        assert!(presence.clear());
        assert!(presence.is_empty());
    }

    #[test]
    fn test_frame_carries_full_object() {
        let mut presence = LocalPresence::new();
        presence.set_field("name", json!("Ada"));
        presence.set_field("cursor", Value::Null);

        let frame = presence.to_frame().unwrap();
        assert_eq!(frame.msg_type, MessageType::Presence);
        let body: Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(body, json!({ "name": "Ada", "cursor": null }));
    }
}
