//! Error taxonomy of the realtime layer.
//!
//! Nothing here is fatal to the application: transport errors are absorbed by
//! failover, write conflicts are retried then dropped, and fetch failures are
//! retried on the next tick.

use std::time::Duration;

use shared::models::Scope;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;

/// Push channel failures. Recovered locally by failing over to polling.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The backend refused or failed the subscribe call
    #[error("push subscription could not be opened: {0}")]
    Subscribe(String),
    /// The server sent an explicit error frame
    #[error("push stream reported error [{code}]: {message}")]
    ErrorFrame {
        /// Server error code
        code: String,
        /// Server error message
        message: String,
    },
    /// No ack inside the ack window, or silence longer than the heartbeat timeout
    #[error("no acknowledgement or heartbeat within {0:?}")]
    HeartbeatTimeout(Duration),
    /// The frame stream ended
    #[error("push stream closed by the server")]
    StreamClosed,
}

/// Failures surfaced by the realtime layer's operations and events.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Push channel failure, absorbed by failover
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Read receipt lost its write race past the retry budget
    #[error("read receipt for conversation {conversation_id} lost a write race")]
    WriteConflict {
        /// Conversation whose receipt was dropped
        conversation_id: Uuid,
    },
    /// A full fetch for a scope failed; retried on the next tick
    #[error("fetch for {scope} failed: {source}")]
    FetchFailure {
        /// Scope being fetched
        scope: Scope,
        /// Backend failure
        #[source]
        source: BackendError,
    },
    /// Any other backend failure
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result alias for realtime operations.
pub type RealtimeResult<T> = Result<T, RealtimeError>;
