use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Timestamp;

/// A message or listing row as seen by the client.
///
/// Identity is `id`; `(created_at, id)` defines the total order used by every
/// store view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Server-assigned identifier (temporary for optimistic entries)
    pub id: Uuid,
    /// Owning conversation or feed partition
    pub parent_id: Uuid,
    /// Message sender or listing owner
    pub sender_id: Uuid,
    /// Opaque row body
    #[serde(default)]
    pub payload: Value,
    /// Server creation time; primary ordering key
    pub created_at: Timestamp,
    /// Whether the recipient has read the record
    #[serde(default, rename = "read_flag")]
    pub read: bool,
    /// Client nonce echoed back by the server for optimistic writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<Uuid>,
    /// Local-only marker for entries not yet acknowledged by the server
    #[serde(skip)]
    pub pending: bool,
}

impl Record {
    /// Ordering key of this record.
    #[must_use]
    pub fn key(&self) -> RecordKey {
        RecordKey {
            created_at: self.created_at,
            id: self.id,
        }
    }

    /// True when the record counts towards `participant`'s unread total.
    #[must_use]
    pub fn is_unread_for(&self, participant: Uuid) -> bool {
        !self.read && self.sender_id != participant
    }

    /// Short text preview of the payload for notifications.
    #[must_use]
    pub fn excerpt(&self, max_chars: usize) -> String {
        let text = match &self.payload {
            Value::String(text) => text.clone(),
            Value::Object(map) => map
                .get("content")
                .or_else(|| map.get("title"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        if text.chars().count() <= max_chars {
            text
        } else {
            let mut cut: String = text.chars().take(max_chars).collect();
            cut.push('…');
            cut
        }
    }
}

/// Total order of records: creation time first, id as tiebreaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    /// Creation time
    pub created_at: Timestamp,
    /// Tiebreaker for equal creation times
    pub id: Uuid,
}

/// A message the local user is about to send.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageDraft {
    /// Conversation the message is posted into
    pub conversation_id: Uuid,
    /// Author of the message
    pub sender_id: Uuid,
    /// Message body
    pub payload: Value,
    /// Nonce the server echoes back on the stored record
    pub client_ref: Uuid,
}

impl MessageDraft {
    /// Builds the optimistic record shown before the server acknowledges.
    #[must_use]
    pub fn optimistic_record(&self) -> Record {
        Record {
            id: Uuid::new_v4(),
            parent_id: self.conversation_id,
            sender_id: self.sender_id,
            payload: self.payload.clone(),
            created_at: Timestamp::now(),
            read: false,
            client_ref: Some(self.client_ref),
            pending: true,
        }
    }
}

/// Server acknowledgement of a read-receipt write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ReadReceiptAck {
    /// Number of records whose read flag was flipped
    pub marked: u32,
}

/// Display metadata for a message sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderProfile {
    /// Profile owner
    pub user_id: Uuid,
    /// Name shown on notifications
    pub display_name: String,
    /// Optional avatar location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn record_at(secs: u32, id: Uuid) -> Record {
        Record {
            id,
            parent_id: Uuid::nil(),
            sender_id: Uuid::nil(),
            payload: json!({"content": "hello"}),
            created_at: Timestamp(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, secs).unwrap()),
            read: false,
            client_ref: None,
            pending: false,
        }
    }

    #[test]
    fn key_orders_by_time_then_id() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        assert!(record_at(1, high).key() < record_at(2, low).key());
        assert!(record_at(1, low).key() < record_at(1, high).key());
    }

    #[test]
    fn unread_excludes_own_messages() {
        let me = Uuid::new_v4();
        let mut record = record_at(0, Uuid::new_v4());
        record.sender_id = me;
        assert!(!record.is_unread_for(me));
        assert!(record.is_unread_for(Uuid::new_v4()));

        record.read = true;
        assert!(!record.is_unread_for(Uuid::new_v4()));
    }

    #[test]
    fn pending_flag_is_not_serialized() {
        let mut record = record_at(0, Uuid::new_v4());
        record.pending = true;
        let json = serde_json::to_value(&record).unwrap();

        assert!(json.get("pending").is_none());
        assert_eq!(json["read_flag"], json!(false));
        let back: Record = serde_json::from_value(json).unwrap();
        assert!(!back.pending);
    }

    #[test]
    fn excerpt_truncates_content() {
        let mut record = record_at(0, Uuid::new_v4());
        record.payload = json!({"content": "abcdefgh"});
        assert_eq!(record.excerpt(4), "abcd…");
        assert_eq!(record.excerpt(20), "abcdefgh");

        record.payload = json!("plain");
        assert_eq!(record.excerpt(20), "plain");
    }
}
