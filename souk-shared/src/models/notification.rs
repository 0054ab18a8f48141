use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{SenderProfile, Timestamp};

/// Transient inbound-message notification. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    /// The message that triggered the notification; doubles as its id
    pub source_record_id: Uuid,
    /// Conversation the message belongs to
    pub conversation_id: Uuid,
    /// Message author
    pub sender_id: Uuid,
    /// Shortened message text
    pub excerpt: String,
    /// Filled in once the sender lookup resolves
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderProfile>,
    /// When the notification expires
    pub display_until: Timestamp,
}

impl Notification {
    /// Display name, falling back to the sender id until the lookup lands.
    #[must_use]
    pub fn sender_label(&self) -> String {
        self.sender
            .as_ref()
            .map_or_else(|| self.sender_id.to_string(), |p| p.display_name.clone())
    }
}

/// Why a notification went away.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DismissReason {
    /// Explicit user dismissal
    User,
    /// Display window elapsed
    Expired,
    /// User navigated into the conversation
    Navigated,
    /// Session ended
    SignedOut,
}

/// Lifecycle events delivered to notification listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// A new notification is on screen
    Shown(Notification),
    /// Sender metadata resolved for an already shown notification
    Enriched(Notification),
    /// A notification was removed
    Dismissed {
        /// Source record id of the dismissed notification
        id: Uuid,
        /// What removed it
        reason: DismissReason,
    },
}
