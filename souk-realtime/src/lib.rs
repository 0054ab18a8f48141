//! Realtime delivery and consistency layer.
//!
//! Keeps conversation messages, unread counters and live listing feeds in sync
//! across an unreliable push channel: a change feed is supervised per scope
//! and replaced by periodic polling while it is unhealthy, both transports feed
//! one dedup store, read receipts update flags and counters as one unit, and a
//! session-wide dispatcher turns inbound messages into transient notifications.

/// Backend contract and adapters.
pub mod backend;
/// Session facade for the UI layer.
pub mod client;
/// Error taxonomy.
pub mod errors;
/// Session-wide notification dispatcher.
pub mod notifications;
/// Read-receipt synchronizer.
pub mod receipts;
/// Merge & dedup store.
pub mod store;
/// Per-subscription transport supervisor.
pub mod supervisor;
/// Push and poll transports.
pub mod transport;

pub use backend::{
    Backend, BackendError, BackendResult, FeedSubscription, HttpBackend, InMemoryBackend, PushMode,
    SharedBackend,
};
pub use client::RealtimeClient;
pub use errors::{RealtimeError, RealtimeResult, TransportError};
pub use notifications::NotificationDispatcher;
pub use receipts::{MarkReadOutcome, ReadReceiptSynchronizer};
pub use store::{MergeStore, StoreSnapshot};
pub use supervisor::{Subscription, TransportSupervisor, WeakSubscription};
