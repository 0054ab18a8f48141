//! Session-level entry point for the UI layer.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    config::client::RealtimeSettings,
    models::{
        ChangeEvent, DismissReason, EventFilter, LinkStatus, MessageDraft, Notification,
        NotificationEvent, Record, Scope,
    },
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::{
    backend::SharedBackend,
    errors::{RealtimeError, RealtimeResult},
    notifications::{ListenerId, NotificationDispatcher},
    receipts::{MarkReadOutcome, ReadReceiptSynchronizer},
    store::StoreSnapshot,
    supervisor::{Subscription, TransportSupervisor, WeakSubscription},
};

/// The session-wide inbox subscription feeding the dispatcher.
struct Session {
    inbox: Subscription,
    dispatcher_task: JoinHandle<()>,
}

/// Realtime layer for one signed-in user.
///
/// Views own the subscriptions they open; the client keeps weak references
/// so re-opening a scope or signing out can still tear them down.
pub struct RealtimeClient {
    user_id: Uuid,
    supervisor: TransportSupervisor,
    receipts: Arc<ReadReceiptSynchronizer>,
    dispatcher: Arc<NotificationDispatcher>,
    open: Mutex<HashMap<Scope, WeakSubscription>>,
    session: Mutex<Option<Session>>,
}

impl RealtimeClient {
    /// Client for `user_id`. Nothing runs until [`start`](Self::start) or
    /// [`open_subscription`](Self::open_subscription).
    #[must_use]
    pub fn new(backend: SharedBackend, settings: RealtimeSettings, user_id: Uuid) -> Self {
        let receipts = Arc::new(ReadReceiptSynchronizer::new(Arc::clone(&backend), &settings));
        let dispatcher = Arc::new(NotificationDispatcher::new(
            user_id,
            Arc::clone(&backend),
            Arc::clone(&receipts),
            &settings,
        ));
        Self {
            user_id,
            supervisor: TransportSupervisor::new(backend, settings),
            receipts,
            dispatcher,
            open: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
        }
    }

    /// The signed-in user.
    #[must_use]
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// Read-receipt synchronizer shared by every view.
    #[must_use]
    pub fn receipts(&self) -> &Arc<ReadReceiptSynchronizer> {
        &self.receipts
    }

    /// Session notification dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }

    /// Spawns the session-wide notification dispatcher. Idempotent.
    pub fn start(&self) {
        let mut session = self.session.lock();
        if session.is_some() {
            return;
        }
        let inbox = self
            .supervisor
            .open(Scope::Inbox(self.user_id), EventFilter::all());
        let arrivals = inbox.arrivals();
        let cancel = inbox.cancellation_token();
        let dispatcher_task = tokio::spawn(Arc::clone(&self.dispatcher).run(arrivals, cancel));
        *session = Some(Session {
            inbox,
            dispatcher_task,
        });
        info!(user_id = %self.user_id, "realtime session started");
    }

    /// Transport health of the session inbox, once started.
    #[must_use]
    pub fn inbox_status(&self) -> Option<watch::Receiver<LinkStatus>> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.inbox.status())
    }

    /// Live view of the session inbox, once started.
    #[must_use]
    pub fn inbox_records(&self) -> Option<watch::Receiver<Arc<StoreSnapshot>>> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.inbox.records())
    }

    /// Unread counts per conversation from the session inbox.
    #[must_use]
    pub fn inbox_unread(&self) -> BTreeMap<Uuid, usize> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.inbox.snapshot().unread_by_parent(self.user_id))
            .unwrap_or_default()
    }

    /// Opens the live view of a scope, replacing any previous subscription
    /// for it. Conversation views are marked read once loaded.
    pub fn open_subscription(&self, scope: Scope) -> Subscription {
        let previous = self.open.lock().remove(&scope);
        if let Some(previous) = previous {
            debug!(scope = %scope, "replacing open subscription");
            previous.close();
        }

        let subscription = self.supervisor.open(scope.clone(), EventFilter::all());
        if let Scope::Conversation(conversation_id) = scope {
            self.receipts.register(conversation_id, subscription.store());
            self.receipts.mark_read_when_loaded(
                conversation_id,
                self.user_id,
                Arc::clone(subscription.store()),
                subscription.cancellation_token(),
            );
        }
        self.open.lock().insert(scope, subscription.downgrade());
        subscription
    }

    /// Marks a conversation read for `user_id` right away.
    ///
    /// # Errors
    /// Returns an error when the backend write fails for a reason other than
    /// a lost write race.
    pub async fn mark_conversation_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> RealtimeResult<MarkReadOutcome> {
        self.receipts.mark_read(conversation_id, user_id).await
    }

    /// Registers a callback for notification lifecycle events.
    pub fn on_notification(
        &self,
        callback: impl Fn(&NotificationEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        self.dispatcher.on_notification(callback)
    }

    /// Dismisses a notification on the user's behalf. Returns false when it
    /// was already gone.
    pub fn dismiss_notification(&self, id: Uuid) -> bool {
        self.dispatcher.dismiss(id)
    }

    /// Notifications currently on screen.
    #[must_use]
    pub fn active_notifications(&self) -> Vec<Notification> {
        self.dispatcher.active()
    }

    /// Declares the conversation currently on screen, or none.
    pub fn set_focus(&self, conversation_id: Option<Uuid>) {
        self.dispatcher.set_focus(conversation_id);
    }

    /// Sends a message, showing it optimistically in the open conversation
    /// until the server confirms it.
    #[instrument(skip(self, payload), fields(user_id = %self.user_id))]
    pub async fn send_message(
        &self,
        conversation_id: Uuid,
        payload: Value,
    ) -> RealtimeResult<Record> {
        let draft = MessageDraft {
            conversation_id,
            sender_id: self.user_id,
            payload,
            client_ref: Uuid::new_v4(),
        };
        let store = self
            .open
            .lock()
            .get(&Scope::Conversation(conversation_id))
            .and_then(WeakSubscription::store);
        if let Some(store) = &store {
            store.insert_optimistic(draft.optimistic_record());
        }

        match self.supervisor.backend().post_message(&draft).await {
            Ok(record) => {
                if let Some(store) = &store {
                    store.apply_change(ChangeEvent::insert(record.clone()));
                }
                Ok(record)
            }
            Err(err) => {
                if let Some(store) = &store {
                    store.discard_optimistic(draft.client_ref);
                }
                Err(RealtimeError::from(err))
            }
        }
    }

    /// Tears down the dispatcher, every open subscription and every shown
    /// notification.
    pub fn sign_out(&self) {
        if let Some(session) = self.session.lock().take() {
            session.inbox.close();
            session.dispatcher_task.abort();
        }
        let open: Vec<WeakSubscription> = self.open.lock().drain().map(|(_, sub)| sub).collect();
        for subscription in open {
            subscription.close();
        }
        self.dispatcher.set_focus(None);
        self.dispatcher.dismiss_all(DismissReason::SignedOut);
        info!(user_id = %self.user_id, "realtime session ended");
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.sign_out();
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("user_id", &self.user_id)
            .field("open", &self.open.lock().len())
            .finish_non_exhaustive()
    }
}
