//! Backend collaborator contract.
//!
//! Everything the realtime layer needs from the managed data service: a push
//! subscription primitive with server-side scope filtering, point-in-time
//! reads, the read-receipt write and a couple of conventional calls used by
//! the session client.

/// REST + SSE adapter.
pub mod http;
/// In-process adapter with fault injection.
pub mod memory;
/// Server-sent-events decoder.
pub mod sse;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use shared::models::{
    ApiError, EventFilter, FeedFrame, MessageDraft, ReadReceiptAck, Record, Scope, SenderProfile,
};
use thiserror::Error;
use uuid::Uuid;

pub use http::HttpBackend;
pub use memory::{InMemoryBackend, PushMode};

/// Ordered frames of one push subscription. End of stream means closed.
pub type FrameStream = BoxStream<'static, FeedFrame>;

/// Handle used to release a push subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// An open push subscription.
pub struct FeedSubscription {
    /// Handle for [`Backend::unsubscribe`]
    pub id: SubscriptionId,
    /// Frames in delivery order
    pub frames: FrameStream,
}

impl fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Failures reported by a [`Backend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// A concurrent write won; the caller may retry
    #[error("write conflict: {0}")]
    Conflict(String),
    /// The service could not be reached or failed
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The push subscription was rejected
    #[error("subscription refused: {0}")]
    Refused(String),
    /// The target row does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// Transport-level HTTP failure
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-success response with a decoded error body
    #[error("backend returned {status}: {error}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Decoded error body
        error: ApiError,
    },
    /// The response body did not match the expected shape
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether the failure is a lost write race worth retrying.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict(_) => true,
            Self::Api { status, error } => *status == 409 || error.is_conflict(),
            _ => false,
        }
    }
}

/// Result alias for backend calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// The managed data service as seen by the realtime layer.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Opens a push subscription filtered server-side by scope and event kind.
    async fn subscribe(&self, scope: &Scope, filter: EventFilter)
    -> BackendResult<FeedSubscription>;

    /// Releases a push subscription. Safe to call more than once.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Full current record set for a scope, ordered by `(created_at, id)`.
    async fn fetch_records(&self, scope: &Scope) -> BackendResult<Vec<Record>>;

    /// Flags every inbound record of the conversation read for `reader_id` and
    /// zeroes the reader's unread counter in one server-side transaction.
    async fn write_read_receipt(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> BackendResult<ReadReceiptAck>;

    /// Stores a message. The returned record echoes the draft's `client_ref`.
    async fn post_message(&self, draft: &MessageDraft) -> BackendResult<Record>;

    /// Display metadata for a sender.
    async fn fetch_profile(&self, user_id: Uuid) -> BackendResult<SenderProfile>;
}

/// Backend shared between every component of a session.
pub type SharedBackend = Arc<dyn Backend>;
