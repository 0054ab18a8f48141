//! Transport supervisor.
//!
//! One supervisor task per subscription drives the link state machine:
//!
//! ```text
//! Connecting ──ack──▶ Live ──error/timeout──▶ Degraded ──▶ Polling
//!                      ▲                                     │
//!                      └────────── push re-established ◀─────┘
//! ```
//!
//! From `Degraded` the poll driver starts at once and push re-establishment
//! is retried in the background on the configured backoff. On success the
//! push transport is already live before polling stops, then one catch-up
//! fetch closes the gap. Exactly one transport feeds the store at a time;
//! output from a stopped instance carries a stale epoch and is discarded.
//!
//! Closing is synchronous and happens on every exit path, including drop.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use metrics::counter;
use parking_lot::Mutex;
use shared::{
    config::client::RealtimeSettings,
    models::{EventFilter, LinkState, LinkStatus, Record, Scope},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    backend::SharedBackend,
    errors::{RealtimeError, TransportError},
    store::{MergeStore, StoreSnapshot},
    transport::{
        ChangeFeedTransport, PollTransport, Transport, TransportEvent, TransportKind,
        TransportMessage, TransportSink,
    },
};

const TRANSITIONS_CAPACITY: usize = 64;

struct Transports {
    push: ChangeFeedTransport,
    poll: PollTransport,
}

/// State shared by the subscription handle and its supervisor task.
struct Control {
    scope: Scope,
    store: Arc<MergeStore>,
    cancel: CancellationToken,
    closed: AtomicBool,
    status: watch::Sender<LinkStatus>,
    transitions: broadcast::Sender<LinkStatus>,
    transports: Mutex<Transports>,
}

impl Control {
    /// Runs `f` unless the subscription is closed. The check happens under
    /// the transports lock, so nothing can be started after `close`.
    fn with_transports(&self, f: impl FnOnce(&mut Transports)) -> bool {
        let mut transports = self.transports.lock();
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        f(&mut transports);
        true
    }

    fn publish(&self, status: LinkStatus) {
        let published = self.status.send_if_modified(|current| {
            if current.is_closed() || *current == status {
                return false;
            }
            *current = status;
            true
        });
        if published {
            let _ = self.transitions.send(status);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.store.seal();
        {
            let mut transports = self.transports.lock();
            transports.push.stop();
            transports.poll.stop();
        }
        let closed = LinkStatus::new(LinkState::Closed);
        self.status.send_replace(closed);
        let _ = self.transitions.send(closed);
        info!(scope = %self.scope, "subscription closed");
    }
}

/// Opens supervised subscriptions against one backend.
#[derive(Clone)]
pub struct TransportSupervisor {
    backend: SharedBackend,
    settings: Arc<RealtimeSettings>,
}

impl TransportSupervisor {
    /// Supervisor opening subscriptions against `backend`.
    #[must_use]
    pub fn new(backend: SharedBackend, settings: RealtimeSettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
        }
    }

    /// Backend every subscription talks to.
    #[must_use]
    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Timing settings applied to new subscriptions.
    #[must_use]
    pub fn settings(&self) -> &RealtimeSettings {
        &self.settings
    }

    /// Starts a supervised subscription. Must be called inside a tokio
    /// runtime.
    #[must_use]
    pub fn open(&self, scope: Scope, filter: EventFilter) -> Subscription {
        let store = Arc::new(MergeStore::new(scope.clone()));
        let (status, _) = watch::channel(LinkStatus::new(LinkState::Connecting));
        let (transitions, _) = broadcast::channel(TRANSITIONS_CAPACITY);

        let push = ChangeFeedTransport::new(
            Arc::clone(&self.backend),
            scope.clone(),
            filter,
            self.settings.heartbeat_timeout(),
        );
        let poll = PollTransport::new(
            Arc::clone(&self.backend),
            Arc::clone(&store),
            self.settings.poll_period(scope.kind()),
        );

        let control = Arc::new(Control {
            scope: scope.clone(),
            store,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            status,
            transitions,
            transports: Mutex::new(Transports { push, poll }),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let task = SupervisorTask {
            control: Arc::clone(&control),
            backend: Arc::clone(&self.backend),
            settings: Arc::clone(&self.settings),
            tx,
            rx,
            next_epoch: 0,
            push_epoch: 0,
            poll_epoch: None,
            reconnect_attempt: 0,
            reconnect_at: None,
            reconcile_at: None,
            state: LinkState::Connecting,
            unstable: false,
        };
        tokio::spawn(task.run());
        info!(scope = %scope, %filter, "subscription opened");

        Subscription { control }
    }
}

/// Owning handle of one logical subscription. Dropping it closes it.
pub struct Subscription {
    control: Arc<Control>,
}

impl Subscription {
    /// Scope this subscription targets.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.control.scope
    }

    /// Store backing the view.
    #[must_use]
    pub fn store(&self) -> &Arc<MergeStore> {
        &self.control.store
    }

    /// Live, deduped, ordered view.
    #[must_use]
    pub fn records(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.control.store.watch()
    }

    /// Latest snapshot of the view.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.control.store.snapshot()
    }

    /// Transport health.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<LinkStatus> {
        self.control.status.subscribe()
    }

    /// Status right now.
    #[must_use]
    pub fn current_status(&self) -> LinkStatus {
        *self.control.status.borrow()
    }

    /// Every status change from now on, without coalescing.
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<LinkStatus> {
        self.control.transitions.subscribe()
    }

    /// Records arriving after the initial load.
    #[must_use]
    pub fn arrivals(&self) -> broadcast::Receiver<Record> {
        self.control.store.arrivals()
    }

    /// Cancelled when the subscription closes.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.control.cancel.clone()
    }

    /// Non-owning reference that can still close the subscription.
    #[must_use]
    pub fn downgrade(&self) -> WeakSubscription {
        WeakSubscription(Arc::downgrade(&self.control))
    }

    /// Closes the subscription. Synchronous and idempotent.
    pub fn close(&self) {
        self.control.close();
    }

    /// Whether the subscription has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.control.closed.load(Ordering::SeqCst)
    }
}

/// Non-owning handle to a [`Subscription`].
#[derive(Clone)]
pub struct WeakSubscription(Weak<Control>);

impl WeakSubscription {
    /// Closes the subscription if it is still alive.
    pub fn close(&self) {
        if let Some(control) = self.0.upgrade() {
            control.close();
        }
    }

    /// Whether the subscription is alive and open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.0
            .upgrade()
            .is_some_and(|control| !control.closed.load(Ordering::SeqCst))
    }

    /// Store of a still-open subscription.
    #[must_use]
    pub fn store(&self) -> Option<Arc<MergeStore>> {
        self.0
            .upgrade()
            .filter(|control| !control.closed.load(Ordering::SeqCst))
            .map(|control| Arc::clone(&control.store))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.control.close();
    }
}

struct SupervisorTask {
    control: Arc<Control>,
    backend: SharedBackend,
    settings: Arc<RealtimeSettings>,
    tx: mpsc::UnboundedSender<TransportMessage>,
    rx: mpsc::UnboundedReceiver<TransportMessage>,
    next_epoch: u64,
    push_epoch: u64,
    poll_epoch: Option<u64>,
    reconnect_attempt: usize,
    reconnect_at: Option<Instant>,
    reconcile_at: Option<Instant>,
    state: LinkState,
    unstable: bool,
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SupervisorTask {
    async fn run(mut self) {
        let cancel = self.control.cancel.clone();
        self.start_push();
        self.reconcile("initial").await;

        loop {
            let reconnect_at = self.reconnect_at;
            let reconcile_at = self.reconcile_at;
            tokio::select! {
                () = cancel.cancelled() => break,
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                () = sleep_until(reconnect_at) => self.reconnect(),
                () = sleep_until(reconcile_at) => {
                    self.reconcile_at = None;
                    self.reconcile("retry").await;
                }
            }
        }
        debug!(scope = %self.control.scope, "supervisor stopped");
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn sink(&self, origin: TransportKind, epoch: u64) -> TransportSink {
        TransportSink::new(origin, epoch, self.tx.clone())
    }

    fn start_push(&mut self) {
        let epoch = self.bump_epoch();
        self.push_epoch = epoch;
        let sink = self.sink(TransportKind::ChangeFeed, epoch);
        self.control.with_transports(|t| t.push.start(sink));
    }

    fn is_current(&self, message: &TransportMessage) -> bool {
        match message.origin {
            TransportKind::ChangeFeed => message.epoch == self.push_epoch,
            TransportKind::Poll => self.poll_epoch == Some(message.epoch),
        }
    }

    async fn handle(&mut self, message: TransportMessage) {
        if !self.is_current(&message) {
            counter!("souk_realtime_stale_messages_total").increment(1);
            debug!(
                scope = %self.control.scope,
                origin = message.origin.as_str(),
                epoch = message.epoch,
                "stale transport output discarded"
            );
            return;
        }

        match message.event {
            TransportEvent::Live => self.on_live().await,
            TransportEvent::Failed(error) => self.on_failed(&error),
            TransportEvent::Change(event) => {
                self.control.store.apply_change(event);
            }
            TransportEvent::Snapshot { records, as_of } => {
                self.control.store.apply_snapshot(records, as_of);
                self.set_unstable(false);
            }
            TransportEvent::FetchFailed { consecutive, .. } => {
                if consecutive >= self.settings.unstable_after_failures {
                    self.set_unstable(true);
                }
            }
        }
    }

    async fn on_live(&mut self) {
        self.reconnect_attempt = 0;
        self.reconnect_at = None;
        let was_polling = self.poll_epoch.take().is_some();
        if was_polling {
            self.control.with_transports(|t| t.poll.stop());
        }
        self.unstable = false;
        self.set_state(LinkState::Live);

        if was_polling {
            counter!("souk_realtime_recoveries_total").increment(1);
            info!(scope = %self.control.scope, "push re-established; poll fallback stopped");
            self.reconcile("catch-up").await;
        }
    }

    fn on_failed(&mut self, error: &TransportError) {
        self.control.with_transports(|t| t.push.stop());
        self.push_epoch = self.bump_epoch();

        if self.poll_epoch.is_none() {
            counter!("souk_realtime_failovers_total").increment(1);
            warn!(scope = %self.control.scope, error = %error, "push transport failed; engaging poll fallback");
            self.set_state(LinkState::Degraded);

            let epoch = self.bump_epoch();
            let sink = self.sink(TransportKind::Poll, epoch);
            if self.control.with_transports(|t| t.poll.start(sink)) {
                self.poll_epoch = Some(epoch);
            }
            self.reconcile_at = None;
            self.set_state(LinkState::Polling);
        } else {
            debug!(
                scope = %self.control.scope,
                error = %error,
                attempt = self.reconnect_attempt,
                "push re-establishment failed"
            );
        }

        let delay = self.settings.reconnect_delay(self.reconnect_attempt);
        self.reconnect_attempt += 1;
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn reconnect(&mut self) {
        self.reconnect_at = None;
        counter!("souk_realtime_reconnect_attempts_total").increment(1);
        debug!(
            scope = %self.control.scope,
            attempt = self.reconnect_attempt,
            "re-establishing push subscription"
        );
        self.start_push();
    }

    /// One out-of-band full fetch: initial load, catch-up after recovery,
    /// or a retry of either.
    async fn reconcile(&mut self, reason: &'static str) {
        let as_of = self.control.store.version();
        let cancel = self.control.cancel.clone();
        let fetched = tokio::select! {
            () = cancel.cancelled() => return,
            fetched = self.backend.fetch_records(&self.control.scope) => fetched,
        };

        match fetched {
            Ok(records) => {
                let changed = self.control.store.apply_snapshot(records, as_of);
                debug!(scope = %self.control.scope, reason, changed, "reconciled with server state");
            }
            Err(source) => {
                let error = RealtimeError::FetchFailure {
                    scope: self.control.scope.clone(),
                    source,
                };
                warn!(reason, error = %error, "reconcile fetch failed");
                if self.poll_epoch.is_none() {
                    let delay = self
                        .settings
                        .reconnect_delay(0)
                        .max(Duration::from_millis(100));
                    self.reconcile_at = Some(Instant::now() + delay);
                }
            }
        }
    }

    fn set_state(&mut self, state: LinkState) {
        self.state = state;
        self.control.publish(LinkStatus {
            state,
            unstable: self.unstable,
        });
        info!(scope = %self.control.scope, state = %state, "link state changed");
    }

    fn set_unstable(&mut self, unstable: bool) {
        if self.unstable == unstable {
            return;
        }
        self.unstable = unstable;
        if unstable {
            warn!(scope = %self.control.scope, "connection unstable");
        }
        self.control.publish(LinkStatus {
            state: self.state,
            unstable,
        });
    }
}

impl std::fmt::Debug for TransportSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSupervisor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("scope", &self.control.scope)
            .field("status", &self.current_status())
            .finish()
    }
}

impl std::fmt::Debug for WeakSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakSubscription")
            .field("open", &self.is_open())
            .finish()
    }
}
