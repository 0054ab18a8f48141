//! Session-wide notification dispatcher.
//!
//! Consumes every inbound message addressed to the signed-in user. Messages
//! for the conversation in focus are suppressed and auto-read; everything
//! else becomes a transient notification that expires after the display
//! window. Dismissal and expiry race through one removal under the state
//! lock, so exactly one of them emits `Dismissed`.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::TimeDelta;
use metrics::counter;
use parking_lot::Mutex;
use shared::{
    config::client::RealtimeSettings,
    models::{
        DismissReason, Notification, NotificationEvent, Record, SenderProfile, Timestamp,
    },
};
use tokio::{sync::broadcast, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{backend::SharedBackend, receipts::ReadReceiptSynchronizer};

const EXCERPT_CHARS: usize = 80;

/// Listener invoked for every notification event.
pub type NotificationCallback = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;

/// Handle returned by [`NotificationDispatcher::on_notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Active {
    notification: Notification,
    expiry: CancellationToken,
}

#[derive(Default)]
struct DispatcherState {
    focus: Option<Uuid>,
    active: HashMap<Uuid, Active>,
    listeners: Vec<(ListenerId, NotificationCallback)>,
    profiles: HashMap<Uuid, SenderProfile>,
}

/// Turns inbound messages into transient notifications, or auto-reads
/// them when their conversation is in focus.
pub struct NotificationDispatcher {
    user_id: Uuid,
    backend: SharedBackend,
    receipts: Arc<ReadReceiptSynchronizer>,
    display: Duration,
    state: Mutex<DispatcherState>,
    next_listener: AtomicU64,
}

impl NotificationDispatcher {
    /// Dispatcher for `user_id`; call [`run`](Self::run) to start consuming.
    #[must_use]
    pub fn new(
        user_id: Uuid,
        backend: SharedBackend,
        receipts: Arc<ReadReceiptSynchronizer>,
        settings: &RealtimeSettings,
    ) -> Self {
        Self {
            user_id,
            backend,
            receipts,
            display: settings.notification_display(),
            state: Mutex::new(DispatcherState::default()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Registers a listener.
    pub fn on_notification(
        &self,
        callback: impl Fn(&NotificationEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.state.lock().listeners.push((id, Arc::new(callback)));
        id
    }

    /// Unregisters a listener. Unknown ids are ignored.
    pub fn remove_listener(&self, id: ListenerId) {
        self.state
            .lock()
            .listeners
            .retain(|(listener, _)| *listener != id);
    }

    /// Conversation currently in focus.
    #[must_use]
    pub fn focus(&self) -> Option<Uuid> {
        self.state.lock().focus
    }

    /// Sets the conversation currently on screen. Focusing a conversation
    /// dismisses its notifications.
    pub fn set_focus(&self, conversation: Option<Uuid>) {
        let dismissed: Vec<Uuid> = {
            let mut state = self.state.lock();
            state.focus = conversation;
            let Some(conversation) = conversation else {
                return;
            };
            let ids: Vec<Uuid> = state
                .active
                .values()
                .filter(|active| active.notification.conversation_id == conversation)
                .map(|active| active.notification.source_record_id)
                .collect();
            ids.into_iter()
                .filter(|id| Self::take_active(&mut state, *id))
                .collect()
        };
        debug!(focus = ?conversation, "focus changed");
        for id in dismissed {
            self.emit(&NotificationEvent::Dismissed {
                id,
                reason: DismissReason::Navigated,
            });
        }
    }

    /// Notifications currently on display, oldest first.
    #[must_use]
    pub fn active(&self) -> Vec<Notification> {
        let mut active: Vec<Notification> = self
            .state
            .lock()
            .active
            .values()
            .map(|active| active.notification.clone())
            .collect();
        active.sort_by_key(|notification| notification.display_until);
        active
    }

    /// User dismissal. Returns false when already gone.
    pub fn dismiss(&self, id: Uuid) -> bool {
        self.dismiss_with(id, DismissReason::User)
    }

    /// Dismisses every active notification with `reason`.
    pub fn dismiss_all(&self, reason: DismissReason) {
        let ids: Vec<Uuid> = {
            let mut state = self.state.lock();
            let ids: Vec<Uuid> = state.active.keys().copied().collect();
            ids.into_iter()
                .filter(|id| Self::take_active(&mut state, *id))
                .collect()
        };
        for id in ids {
            self.emit(&NotificationEvent::Dismissed { id, reason });
        }
    }

    fn dismiss_with(&self, id: Uuid, reason: DismissReason) -> bool {
        let removed = Self::take_active(&mut self.state.lock(), id);
        if removed {
            debug!(%id, ?reason, "notification dismissed");
            self.emit(&NotificationEvent::Dismissed { id, reason });
        }
        removed
    }

    fn take_active(state: &mut DispatcherState, id: Uuid) -> bool {
        match state.active.remove(&id) {
            Some(active) => {
                active.expiry.cancel();
                true
            }
            None => false,
        }
    }

    fn emit(&self, event: &NotificationEvent) {
        let listeners: Vec<NotificationCallback> = self
            .state
            .lock()
            .listeners
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Routes one inbound message.
    pub fn handle_inbound(self: &Arc<Self>, record: &Record) {
        if record.sender_id == self.user_id || record.read || record.pending {
            return;
        }
        let conversation_id = record.parent_id;

        let (notification, expiry, needs_profile) = {
            let mut state = self.state.lock();
            if state.focus == Some(conversation_id) {
                drop(state);
                counter!("souk_realtime_notifications_suppressed_total").increment(1);
                debug!(%conversation_id, record = %record.id, "conversation in focus; auto-reading");
                self.receipts.request_mark_read(conversation_id, self.user_id);
                return;
            }
            if state.active.contains_key(&record.id) {
                return;
            }

            let sender = state.profiles.get(&record.sender_id).cloned();
            let needs_profile = sender.is_none();
            let window = TimeDelta::from_std(self.display).unwrap_or(TimeDelta::zero());
            let notification = Notification {
                source_record_id: record.id,
                conversation_id,
                sender_id: record.sender_id,
                excerpt: record.excerpt(EXCERPT_CHARS),
                sender,
                display_until: Timestamp(Timestamp::now().0 + window),
            };
            let expiry = CancellationToken::new();
            state.active.insert(
                record.id,
                Active {
                    notification: notification.clone(),
                    expiry: expiry.clone(),
                },
            );
            (notification, expiry, needs_profile)
        };

        counter!("souk_realtime_notifications_shown_total").increment(1);
        info!(%conversation_id, record = %record.id, "notification shown");
        self.emit(&NotificationEvent::Shown(notification));

        if needs_profile {
            self.spawn_profile_lookup(record.id, record.sender_id);
        }
        self.spawn_expiry(record.id, expiry);
    }

    fn spawn_expiry(self: &Arc<Self>, id: Uuid, expiry: CancellationToken) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = expiry.cancelled() => {}
                () = time::sleep(dispatcher.display) => {
                    dispatcher.dismiss_with(id, DismissReason::Expired);
                }
            }
        });
    }

    fn spawn_profile_lookup(self: &Arc<Self>, id: Uuid, sender_id: Uuid) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let profile = match dispatcher.backend.fetch_profile(sender_id).await {
                Ok(profile) => profile,
                Err(err) => {
                    warn!(%sender_id, error = %err, "sender lookup failed");
                    return;
                }
            };
            let enriched = {
                let mut state = dispatcher.state.lock();
                state.profiles.insert(sender_id, profile.clone());
                state.active.get_mut(&id).map(|active| {
                    active.notification.sender = Some(profile);
                    active.notification.clone()
                })
            };
            if let Some(notification) = enriched {
                dispatcher.emit(&NotificationEvent::Enriched(notification));
            }
        });
    }

    /// Drives the dispatcher from the inbox subscription's arrivals until
    /// cancelled.
    pub async fn run(
        self: Arc<Self>,
        mut arrivals: broadcast::Receiver<Record>,
        cancel: CancellationToken,
    ) {
        loop {
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                received = arrivals.recv() => received,
            };
            match received {
                Ok(record) => self.handle_inbound(&record),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification dispatcher lagged behind inbox");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("notification dispatcher stopped");
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NotificationDispatcher")
            .field("user_id", &self.user_id)
            .field("focus", &state.focus)
            .field("active", &state.active.len())
            .finish_non_exhaustive()
    }
}
