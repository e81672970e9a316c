use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type tags understood by the backend.
pub mod kinds {
    pub const CARD: &str = "card";
    pub const CARD_REMOVE: &str = "card:remove";
    pub const READER_CONNECT: &str = "reader:connect";
    pub const READER_DISCONNECT: &str = "reader:disconnect";
    pub const ERROR: &str = "error";
    pub const WRITE_PROGRESS: &str = "write:progress";
    pub const WRITE_COMPLETE: &str = "card:write-complete";
}

/// One outbound observation. Immutable once created: the relay either
/// delivers it, queues it, or drops it on a terminal rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Agent-local failure reported through the same pipeline as tag scans.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(kinds::ERROR, serde_json::json!({ "message": message.into() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_backend_field_names() {
        let event = Event::new(kinds::CARD, serde_json::json!({ "uid": "04A1B2" }));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "card");
        assert_eq!(value["data"]["uid"], "04A1B2");
        assert!(value["id"].is_string());
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn ids_are_unique() {
        let a = Event::error("boom");
        let b = Event::error("boom");
        assert_ne!(a.id, b.id);
        assert_eq!(a.data["message"], "boom");
    }
}
