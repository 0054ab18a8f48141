//! Swappable transports behind one `start`/`stop` interface.
//!
//! A transport never touches the store directly; it reports everything
//! through a [`TransportSink`] stamped with the epoch of the instance that
//! produced it, so the supervisor can discard output from an instance it has
//! already stopped.

/// Push transport.
pub mod change_feed;
/// Poll fallback transport.
pub mod poll;

use shared::models::{ChangeEvent, Record};
use tokio::sync::mpsc;

use crate::errors::{RealtimeError, TransportError};

pub use change_feed::ChangeFeedTransport;
pub use poll::PollTransport;

/// Which transport produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Push change feed
    ChangeFeed,
    /// Poll fallback
    Poll,
}

impl TransportKind {
    /// Name used in log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChangeFeed => "change_feed",
            Self::Poll => "poll",
        }
    }
}

/// Everything a transport reports to its supervisor.
#[derive(Debug)]
pub enum TransportEvent {
    /// Push subscription acknowledged
    Live,
    /// Push subscription failed; the instance has already released itself
    Failed(TransportError),
    /// Row-level change, forwarded unmodified
    Change(ChangeEvent),
    /// Full record set read by a fetch that started at store version `as_of`
    Snapshot {
        /// Records in `(created_at, id)` order
        records: Vec<Record>,
        /// Store version when the fetch started
        as_of: u64,
    },
    /// A poll fetch failed
    FetchFailed {
        /// Always [`RealtimeError::FetchFailure`]
        error: RealtimeError,
        /// Failures since the last successful fetch
        consecutive: u32,
    },
}

/// A [`TransportEvent`] stamped with its origin.
#[derive(Debug)]
pub struct TransportMessage {
    /// Producing transport
    pub origin: TransportKind,
    /// Epoch of the producing instance
    pub epoch: u64,
    /// Payload
    pub event: TransportEvent,
}

/// Event callback handed to a transport when it starts.
#[derive(Debug, Clone)]
pub struct TransportSink {
    origin: TransportKind,
    epoch: u64,
    tx: mpsc::UnboundedSender<TransportMessage>,
}

impl TransportSink {
    /// Sink stamping every message with `origin` and `epoch`.
    #[must_use]
    pub fn new(
        origin: TransportKind,
        epoch: u64,
        tx: mpsc::UnboundedSender<TransportMessage>,
    ) -> Self {
        Self { origin, epoch, tx }
    }

    /// Epoch this sink stamps.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns false once the receiving supervisor is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TransportMessage {
                origin: self.origin,
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// A swappable delivery strategy driven by the supervisor.
pub trait Transport: Send {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Begins delivering into `sink` on background tasks. Starting a running
    /// transport restarts it.
    fn start(&mut self, sink: TransportSink);

    /// Stops delivery and releases every resource. Synchronous and idempotent.
    fn stop(&mut self);

    /// Whether the transport is delivering.
    fn is_running(&self) -> bool;
}
