use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::Record;

/// Row-level mutation kind carried by the push feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// New row
    Insert,
    /// Changed row
    Update,
    /// Removed row
    Delete,
}

impl ChangeKind {
    /// Wire name of the change kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown change kind `{other}`")),
        }
    }
}

/// Set of change kinds a subscription accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::struct_excessive_bools)]
pub struct EventFilter {
    /// Accept inserts
    pub insert: bool,
    /// Accept updates
    pub update: bool,
    /// Accept deletes
    pub delete: bool,
}

impl EventFilter {
    /// Accepts every change kind.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            insert: true,
            update: true,
            delete: true,
        }
    }

    /// Accepts inserts only.
    #[must_use]
    pub const fn inserts_only() -> Self {
        Self {
            insert: true,
            update: false,
            delete: false,
        }
    }

    /// Whether `kind` passes the filter.
    #[must_use]
    pub const fn contains(self, kind: ChangeKind) -> bool {
        match kind {
            ChangeKind::Insert => self.insert,
            ChangeKind::Update => self.update,
            ChangeKind::Delete => self.delete,
        }
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&str> = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]
            .into_iter()
            .filter(|kind| self.contains(*kind))
            .map(ChangeKind::as_str)
            .collect();
        f.write_str(&kinds.join(","))
    }
}

impl FromStr for EventFilter {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut filter = Self {
            insert: false,
            update: false,
            delete: false,
        };
        for part in value.split(',').filter(|part| !part.trim().is_empty()) {
            match part.parse::<ChangeKind>()? {
                ChangeKind::Insert => filter.insert = true,
                ChangeKind::Update => filter.update = true,
                ChangeKind::Delete => filter.delete = true,
            }
        }
        Ok(filter)
    }
}

/// One row-level mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    /// What happened to the row
    pub kind: ChangeKind,
    /// Row state after the change; for deletes, the last known state
    pub record: Record,
}

impl ChangeEvent {
    /// Insert event for `record`.
    #[must_use]
    pub fn insert(record: Record) -> Self {
        Self {
            kind: ChangeKind::Insert,
            record,
        }
    }

    /// Update event for `record`.
    #[must_use]
    pub fn update(record: Record) -> Self {
        Self {
            kind: ChangeKind::Update,
            record,
        }
    }

    /// Delete event for `record`.
    #[must_use]
    pub fn delete(record: Record) -> Self {
        Self {
            kind: ChangeKind::Delete,
            record,
        }
    }
}

/// Payload of an error frame on the push stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamErrorEvent {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable description
    pub message: String,
}

/// Frames delivered by a push subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    /// Server acknowledged the subscription
    Ack,
    /// Keep-alive
    Heartbeat,
    /// Row-level change matching the subscription filter
    Change(ChangeEvent),
    /// Explicit error frame; the subscription is unusable afterwards
    Error(StreamErrorEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_text_form() {
        assert_eq!(EventFilter::all().to_string(), "insert,update,delete");
        assert_eq!(EventFilter::inserts_only().to_string(), "insert");

        let parsed: EventFilter = "update, delete".parse().unwrap();
        assert!(!parsed.contains(ChangeKind::Insert));
        assert!(parsed.contains(ChangeKind::Update));
        assert!(parsed.contains(ChangeKind::Delete));

        assert!("upsert".parse::<EventFilter>().is_err());
    }

    #[test]
    fn change_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ChangeKind::Delete).unwrap(),
            "\"delete\""
        );
    }
}
