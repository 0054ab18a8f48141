/// Error bodies returned by the backend.
pub mod errors;
/// Change feed frames and event filters.
pub mod feed;
/// Transient inbound-message notifications.
pub mod notification;
/// Records, drafts and sender profiles.
pub mod record;
/// Subscription scopes.
pub mod scope;
/// Transport health.
pub mod status;
/// Timestamp wrapper.
pub mod timestamp;

pub use errors::ApiError;
pub use feed::{ChangeEvent, ChangeKind, EventFilter, FeedFrame, StreamErrorEvent};
pub use notification::{DismissReason, Notification, NotificationEvent};
pub use record::{MessageDraft, ReadReceiptAck, Record, RecordKey, SenderProfile};
pub use scope::{Scope, ScopeKind, ScopeParseError};
pub use status::{LinkState, LinkStatus};
pub use timestamp::Timestamp;
