//! Change feed client: one push subscription, no internal retry.
//!
//! Forwards every change unmodified and reports `Live` on the first ack. An
//! error frame, a closed stream or a silence longer than the heartbeat
//! timeout is reported as `Failed`, after which the instance releases its
//! subscription and goes quiet. Retry policy belongs to the supervisor.

use std::{sync::Arc, time::Duration};

use futures_util::StreamExt;
use parking_lot::Mutex;
use shared::models::{EventFilter, FeedFrame, Scope};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{Transport, TransportEvent, TransportKind, TransportSink};
use crate::{
    backend::{SharedBackend, SubscriptionId},
    errors::TransportError,
};

/// Push handle shared between the reader task and `stop`.
#[derive(Default)]
struct PushSlot {
    id: Option<SubscriptionId>,
    released: bool,
}

impl PushSlot {
    fn release(&mut self, backend: &SharedBackend) {
        self.released = true;
        if let Some(id) = self.id.take() {
            backend.unsubscribe(id);
        }
    }
}

struct Running {
    cancel: CancellationToken,
    slot: Arc<Mutex<PushSlot>>,
}

/// Push transport over one backend subscription.
pub struct ChangeFeedTransport {
    backend: SharedBackend,
    scope: Scope,
    filter: EventFilter,
    heartbeat_timeout: Duration,
    running: Option<Running>,
}

impl ChangeFeedTransport {
    /// Transport for `scope`; `heartbeat_timeout` bounds both the ack
    /// window and silence between frames.
    #[must_use]
    pub fn new(
        backend: SharedBackend,
        scope: Scope,
        filter: EventFilter,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            scope,
            filter,
            heartbeat_timeout,
            running: None,
        }
    }
}

impl Transport for ChangeFeedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ChangeFeed
    }

    fn start(&mut self, sink: TransportSink) {
        self.stop();
        let cancel = CancellationToken::new();
        let slot = Arc::new(Mutex::new(PushSlot::default()));
        let reader = FeedReader {
            backend: Arc::clone(&self.backend),
            scope: self.scope.clone(),
            filter: self.filter,
            heartbeat_timeout: self.heartbeat_timeout,
            sink,
            cancel: cancel.clone(),
            slot: Arc::clone(&slot),
        };
        tokio::spawn(reader.run());
        self.running = Some(Running { cancel, slot });
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.slot.lock().release(&self.backend);
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.cancel.is_cancelled())
    }
}

impl Drop for ChangeFeedTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FeedReader {
    backend: SharedBackend,
    scope: Scope,
    filter: EventFilter,
    heartbeat_timeout: Duration,
    sink: TransportSink,
    cancel: CancellationToken,
    slot: Arc<Mutex<PushSlot>>,
}

impl FeedReader {
    async fn run(self) {
        let epoch = self.sink.epoch();
        // Fixed ack window; heartbeats do not extend it.
        let ack_deadline = time::Instant::now() + self.heartbeat_timeout;
        let subscribed = tokio::select! {
            () = self.cancel.cancelled() => return,
            result = time::timeout(
                self.heartbeat_timeout,
                self.backend.subscribe(&self.scope, self.filter),
            ) => result,
        };

        let mut feed = match subscribed {
            Ok(Ok(feed)) => feed,
            Ok(Err(err)) => {
                self.fail(TransportError::Subscribe(err.to_string()));
                return;
            }
            Err(_) => {
                self.fail(TransportError::HeartbeatTimeout(self.heartbeat_timeout));
                return;
            }
        };

        {
            let mut slot = self.slot.lock();
            if slot.released {
                drop(slot);
                self.backend.unsubscribe(feed.id);
                return;
            }
            slot.id = Some(feed.id);
        }
        debug!(scope = %self.scope, epoch, subscription = %feed.id, "push subscription requested");

        let mut acknowledged = false;
        let failure = loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return,
                () = time::sleep_until(ack_deadline), if !acknowledged => {
                    break TransportError::HeartbeatTimeout(self.heartbeat_timeout);
                }
                next = time::timeout(self.heartbeat_timeout, feed.frames.next()) => next,
            };
            match next {
                Err(_) => break TransportError::HeartbeatTimeout(self.heartbeat_timeout),
                Ok(None) => break TransportError::StreamClosed,
                Ok(Some(FeedFrame::Error(frame))) => {
                    break TransportError::ErrorFrame {
                        code: frame.code,
                        message: frame.message,
                    };
                }
                Ok(Some(FeedFrame::Ack)) => {
                    if !acknowledged {
                        acknowledged = true;
                        debug!(scope = %self.scope, epoch, "push subscription acknowledged");
                        if !self.sink.emit(TransportEvent::Live) {
                            return;
                        }
                    }
                }
                Ok(Some(FeedFrame::Heartbeat)) => {
                    trace!(scope = %self.scope, epoch, "heartbeat");
                }
                Ok(Some(FeedFrame::Change(event))) => {
                    if !self.sink.emit(TransportEvent::Change(event)) {
                        return;
                    }
                }
            }
        };

        self.fail(failure);
    }

    fn fail(&self, error: TransportError) {
        if self.cancel.is_cancelled() {
            return;
        }
        warn!(scope = %self.scope, epoch = self.sink.epoch(), error = %error, "push transport failed");
        self.slot.lock().release(&self.backend);
        self.cancel.cancel();
        self.sink.emit(TransportEvent::Failed(error));
    }
}

impl Drop for FeedReader {
    fn drop(&mut self) {
        self.slot.lock().release(&self.backend);
    }
}

impl std::fmt::Debug for ChangeFeedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeedTransport")
            .field("scope", &self.scope)
            .field("filter", &self.filter)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{InMemoryBackend, PushMode},
        transport::TransportMessage,
    };
    use serde_json::json;
    use shared::models::ChangeKind;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(12);

    fn setup(
        backend: &Arc<InMemoryBackend>,
        scope: Scope,
    ) -> (
        ChangeFeedTransport,
        mpsc::UnboundedReceiver<TransportMessage>,
    ) {
        let shared: SharedBackend = backend.clone();
        let mut transport = ChangeFeedTransport::new(shared, scope, EventFilter::all(), TIMEOUT);
        let (tx, rx) = mpsc::unbounded_channel();
        transport.start(TransportSink::new(TransportKind::ChangeFeed, 1, tx));
        (transport, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_ack_and_changes() {
        let backend = Arc::new(InMemoryBackend::with_heartbeat_interval(Duration::from_secs(5)));
        let (buyer, seller) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = backend.create_conversation(buyer, seller);
        let (_transport, mut rx) = setup(&backend, Scope::Conversation(conversation));

        let live = rx.recv().await.unwrap();
        assert!(matches!(live.event, TransportEvent::Live));
        assert_eq!(live.epoch, 1);

        backend
            .insert_message(conversation, seller, json!("hello"))
            .unwrap();
        let change = rx.recv().await.unwrap();
        assert!(matches!(change.event, TransportEvent::Change(e) if e.kind == ChangeKind::Insert));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_subscription_times_out() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_push_mode(PushMode::Silent);
        let started = time::Instant::now();
        let (_transport, mut rx) = setup(&backend, Scope::Inbox(Uuid::new_v4()));

        let failed = rx.recv().await.unwrap();
        assert!(matches!(
            failed.event,
            TransportEvent::Failed(TransportError::HeartbeatTimeout(_))
        ));
        assert!(started.elapsed() >= TIMEOUT);
        assert_eq!(backend.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_without_ack_still_time_out() {
        let backend = Arc::new(InMemoryBackend::with_heartbeat_interval(Duration::from_secs(1)));
        backend.set_push_mode(PushMode::Unacknowledged);
        let started = time::Instant::now();
        let (_transport, mut rx) = setup(&backend, Scope::Inbox(Uuid::new_v4()));

        let failed = rx.recv().await.unwrap();
        assert!(matches!(
            failed.event,
            TransportEvent::Failed(TransportError::HeartbeatTimeout(_))
        ));
        assert!(started.elapsed() >= TIMEOUT);
        assert!(started.elapsed() < TIMEOUT * 2);
        assert_eq!(backend.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_subscription_alive() {
        let backend = Arc::new(InMemoryBackend::with_heartbeat_interval(Duration::from_secs(5)));
        let (_transport, mut rx) = setup(&backend, Scope::Feed("active".into()));
        assert!(matches!(rx.recv().await.unwrap().event, TransportEvent::Live));

        time::sleep(TIMEOUT * 4).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(backend.active_subscriptions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_frame_and_refusal_are_reported() {
        let backend = Arc::new(InMemoryBackend::new());
        let (_transport, mut rx) = setup(&backend, Scope::Feed("active".into()));
        assert!(matches!(rx.recv().await.unwrap().event, TransportEvent::Live));

        backend.fail_push("503", "realtime unavailable");
        assert!(matches!(
            rx.recv().await.unwrap().event,
            TransportEvent::Failed(TransportError::ErrorFrame { code, .. }) if code == "503"
        ));

        backend.set_push_mode(PushMode::Refuse);
        let (_transport, mut rx) = setup(&backend, Scope::Feed("active".into()));
        assert!(matches!(
            rx.recv().await.unwrap().event,
            TransportEvent::Failed(TransportError::Subscribe(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_subscription_synchronously() {
        let backend = Arc::new(InMemoryBackend::new());
        let (mut transport, mut rx) = setup(&backend, Scope::Feed("active".into()));
        assert!(matches!(rx.recv().await.unwrap().event, TransportEvent::Live));
        assert_eq!(backend.active_subscriptions(), 1);

        transport.stop();
        transport.stop();

        assert_eq!(backend.active_subscriptions(), 0);
        assert!(!transport.is_running());
    }
}
