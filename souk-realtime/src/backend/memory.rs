//! In-process backend.
//!
//! A complete transactional stand-in for the managed data service, used by the
//! test suites and the CLI demo. Read flags and unread counters are mutated
//! under one lock, so no subscriber can observe one without the other. Faults
//! can be injected on every path the realtime layer has to survive.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::TimeDelta;
use parking_lot::Mutex;
use serde_json::{Value, json};
use shared::models::{
    ChangeEvent, EventFilter, FeedFrame, MessageDraft, ReadReceiptAck, Record, Scope,
    SenderProfile, StreamErrorEvent, Timestamp,
};
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Backend, BackendError, BackendResult, FeedSubscription, SubscriptionId};

/// Parent id shared by every listing row.
pub const LISTING_PARTITION: Uuid = Uuid::nil();

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How new push subscriptions behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushMode {
    /// Acknowledge, heartbeat and deliver
    #[default]
    Normal,
    /// Subscriptions open but never acknowledge, heartbeat or deliver
    Silent,
    /// Subscriptions heartbeat but never acknowledge or deliver
    Unacknowledged,
    /// Subscribe calls fail
    Refuse,
}

#[derive(Debug)]
struct Conversation {
    participants: Vec<Uuid>,
    unread: HashMap<Uuid, u32>,
}

struct Listener {
    scope: Scope,
    filter: EventFilter,
    silent: bool,
    tx: mpsc::UnboundedSender<FeedFrame>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    conversations: HashMap<Uuid, Conversation>,
    messages: HashMap<Uuid, Record>,
    listings: HashMap<Uuid, Record>,
    profiles: HashMap<Uuid, SenderProfile>,
    listeners: HashMap<SubscriptionId, Listener>,
    push_mode: PushMode,
    fetch_delay: Duration,
    failing_fetches: u32,
    pending_conflicts: u32,
    failing_posts: u32,
    last_created: Option<Timestamp>,
}

fn listing_status(record: &Record) -> Option<&str> {
    record.payload.get("status").and_then(Value::as_str)
}

impl State {
    /// Strictly increasing creation times keep `(created_at, id)` order stable
    /// for rows inserted within the same clock tick.
    fn next_timestamp(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let stamp = match self.last_created {
            Some(last) if now <= last => Timestamp(last.0 + TimeDelta::milliseconds(1)),
            _ => now,
        };
        self.last_created = Some(stamp);
        stamp
    }

    fn message_matches(&self, scope: &Scope, record: &Record) -> bool {
        match scope {
            Scope::Conversation(id) => record.parent_id == *id,
            Scope::Inbox(user) => {
                record.sender_id != *user
                    && self
                        .conversations
                        .get(&record.parent_id)
                        .is_some_and(|conversation| conversation.participants.contains(user))
            }
            Scope::Feed(_) => false,
        }
    }

    fn scope_records(&self, scope: &Scope) -> Vec<Record> {
        let mut records: Vec<Record> = match scope {
            Scope::Feed(status) => self
                .listings
                .values()
                .filter(|listing| listing_status(listing) == Some(status.as_str()))
                .cloned()
                .collect(),
            _ => self
                .messages
                .values()
                .filter(|message| self.message_matches(scope, message))
                .cloned()
                .collect(),
        };
        records.sort_by_key(Record::key);
        records
    }

    fn deliver(listener: &Listener, event: ChangeEvent) {
        if listener.silent || !listener.filter.contains(event.kind) {
            return;
        }
        // A dropped receiver is cleaned up by its unsubscribe call.
        let _ = listener.tx.send(FeedFrame::Change(event));
    }

    fn notify_message(&self, event: &ChangeEvent) {
        for listener in self.listeners.values() {
            if self.message_matches(&listener.scope, &event.record) {
                Self::deliver(listener, event.clone());
            }
        }
    }

    /// Feed subscribers see a status change as the row entering or leaving
    /// their filter.
    fn notify_listing(&self, before: Option<&Record>, after: Option<&Record>) {
        for listener in self.listeners.values() {
            let Scope::Feed(status) = &listener.scope else {
                continue;
            };
            let was_in = before.is_some_and(|row| listing_status(row) == Some(status.as_str()));
            let is_in = after.is_some_and(|row| listing_status(row) == Some(status.as_str()));
            let event = match (was_in, is_in, before, after) {
                (true, true, _, Some(row)) => ChangeEvent::update(row.clone()),
                (false, true, _, Some(row)) => ChangeEvent::insert(row.clone()),
                (true, false, Some(row), _) => ChangeEvent::delete(row.clone()),
                _ => continue,
            };
            Self::deliver(listener, event);
        }
    }

    fn insert_message(
        &mut self,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: Value,
        client_ref: Option<Uuid>,
    ) -> BackendResult<Record> {
        let created_at = self.next_timestamp();
        let conversation = self
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| BackendError::NotFound(format!("conversation {conversation_id}")))?;

        for participant in &conversation.participants {
            if *participant != sender_id {
                *conversation.unread.entry(*participant).or_default() += 1;
            }
        }

        let record = Record {
            id: Uuid::new_v4(),
            parent_id: conversation_id,
            sender_id,
            payload,
            created_at,
            read: false,
            client_ref,
            pending: false,
        };
        self.messages.insert(record.id, record.clone());
        self.notify_message(&ChangeEvent::insert(record.clone()));
        Ok(record)
    }
}

/// Transactional in-process backend.
pub struct InMemoryBackend {
    state: Mutex<State>,
    heartbeat_interval: Duration,
    next_subscription: AtomicU64,
    subscribes: AtomicUsize,
    fetches: AtomicUsize,
    receipt_writes: AtomicUsize,
    profile_lookups: AtomicUsize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Backend with the default heartbeat interval.
    #[must_use]
    pub fn new() -> Self {
        Self::with_heartbeat_interval(DEFAULT_HEARTBEAT_INTERVAL)
    }

    /// Live subscribers receive a heartbeat frame every `interval`.
    #[must_use]
    pub fn with_heartbeat_interval(interval: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            heartbeat_interval: interval,
            next_subscription: AtomicU64::new(1),
            subscribes: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            receipt_writes: AtomicUsize::new(0),
            profile_lookups: AtomicUsize::new(0),
        }
    }

    // -- data administration -------------------------------------------------

    /// Creates a two-party conversation and returns its id.
    pub fn create_conversation(&self, buyer: Uuid, seller: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        let conversation = Conversation {
            participants: vec![buyer, seller],
            unread: HashMap::from([(buyer, 0), (seller, 0)]),
        };
        self.state.lock().conversations.insert(id, conversation);
        id
    }

    /// Registers display metadata for a sender.
    pub fn add_profile(&self, profile: SenderProfile) {
        self.state.lock().profiles.insert(profile.user_id, profile);
    }

    /// Inserts a message as the server would, bumping the unread counter of
    /// every other participant.
    pub fn insert_message(
        &self,
        conversation_id: Uuid,
        sender_id: Uuid,
        payload: Value,
    ) -> BackendResult<Record> {
        self.state
            .lock()
            .insert_message(conversation_id, sender_id, payload, None)
    }

    /// Replaces a message payload and notifies subscribers.
    pub fn update_message(&self, id: Uuid, payload: Value) -> BackendResult<Record> {
        let mut state = self.state.lock();
        let record = state
            .messages
            .get_mut(&id)
            .ok_or_else(|| BackendError::NotFound(format!("message {id}")))?;
        record.payload = payload;
        let record = record.clone();
        state.notify_message(&ChangeEvent::update(record.clone()));
        Ok(record)
    }

    /// Removes a message, adjusting unread counters if it was unread.
    pub fn delete_message(&self, id: Uuid) -> BackendResult<Record> {
        let mut state = self.state.lock();
        let record = state
            .messages
            .remove(&id)
            .ok_or_else(|| BackendError::NotFound(format!("message {id}")))?;
        if !record.read
            && let Some(conversation) = state.conversations.get_mut(&record.parent_id)
        {
            for (participant, count) in &mut conversation.unread {
                if *participant != record.sender_id {
                    *count = count.saturating_sub(1);
                }
            }
        }
        state.notify_message(&ChangeEvent::delete(record.clone()));
        Ok(record)
    }

    /// Publishes a listing row with the given status.
    pub fn publish_listing(&self, owner_id: Uuid, title: &str, status: &str) -> Record {
        let mut state = self.state.lock();
        let record = Record {
            id: Uuid::new_v4(),
            parent_id: LISTING_PARTITION,
            sender_id: owner_id,
            payload: json!({ "title": title, "status": status }),
            created_at: state.next_timestamp(),
            read: false,
            client_ref: None,
            pending: false,
        };
        state.listings.insert(record.id, record.clone());
        state.notify_listing(None, Some(&record));
        record
    }

    /// Moves a listing between feed filters.
    pub fn set_listing_status(&self, id: Uuid, status: &str) -> BackendResult<Record> {
        let mut state = self.state.lock();
        let before = state
            .listings
            .get(&id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("listing {id}")))?;
        let mut after = before.clone();
        if let Value::Object(fields) = &mut after.payload {
            fields.insert("status".to_string(), Value::String(status.to_string()));
        } else {
            after.payload = json!({ "status": status });
        }
        state.listings.insert(id, after.clone());
        state.notify_listing(Some(&before), Some(&after));
        Ok(after)
    }

    /// Deletes a listing.
    pub fn remove_listing(&self, id: Uuid) -> BackendResult<Record> {
        let mut state = self.state.lock();
        let before = state
            .listings
            .remove(&id)
            .ok_or_else(|| BackendError::NotFound(format!("listing {id}")))?;
        state.notify_listing(Some(&before), None);
        Ok(before)
    }

    // -- fault injection -----------------------------------------------------

    /// Applies to subscriptions opened from now on.
    pub fn set_push_mode(&self, mode: PushMode) {
        self.state.lock().push_mode = mode;
    }

    /// Sends an error frame to every open subscription and closes them.
    pub fn fail_push(&self, code: &str, message: &str) {
        let mut state = self.state.lock();
        let frame = FeedFrame::Error(StreamErrorEvent {
            code: code.to_string(),
            message: message.to_string(),
        });
        for (id, listener) in state.listeners.drain() {
            let _ = listener.tx.send(frame.clone());
            listener.cancel.cancel();
            debug!(subscription = %id, "push subscription failed by injection");
        }
    }

    /// Closes every open subscription without an error frame.
    pub fn drop_push(&self) {
        let mut state = self.state.lock();
        for (_, listener) in state.listeners.drain() {
            listener.cancel.cancel();
        }
    }

    /// Every fetch waits this long before reading state.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.state.lock().fetch_delay = delay;
    }

    /// Fails the next `count` record fetches.
    pub fn fail_next_fetches(&self, count: u32) {
        self.state.lock().failing_fetches = count;
    }

    /// Answers the next `count` read-receipt writes with a conflict.
    pub fn conflict_next_receipts(&self, count: u32) {
        self.state.lock().pending_conflicts = count;
    }

    /// Fails the next `count` message posts.
    pub fn fail_next_posts(&self, count: u32) {
        self.state.lock().failing_posts = count;
    }

    // -- inspection ----------------------------------------------------------

    /// Direct point-in-time read, bypassing delays and faults.
    pub fn records(&self, scope: &Scope) -> Vec<Record> {
        self.state.lock().scope_records(scope)
    }

    /// Server-side unread counter of `participant` on a conversation.
    pub fn unread_count(&self, conversation_id: Uuid, participant: Uuid) -> u32 {
        self.state
            .lock()
            .conversations
            .get(&conversation_id)
            .and_then(|conversation| conversation.unread.get(&participant).copied())
            .unwrap_or_default()
    }

    /// True when every participant's counter equals the number of unread
    /// records from others in the conversation.
    pub fn counters_consistent(&self, conversation_id: Uuid) -> bool {
        let state = self.state.lock();
        let Some(conversation) = state.conversations.get(&conversation_id) else {
            return true;
        };
        conversation.participants.iter().all(|participant| {
            let flagged = state
                .messages
                .values()
                .filter(|m| m.parent_id == conversation_id && m.is_unread_for(*participant))
                .count();
            conversation.unread.get(participant).copied().unwrap_or_default() as usize == flagged
        })
    }

    /// Push subscriptions not yet released.
    pub fn active_subscriptions(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Subscribe calls so far, including refused ones.
    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Record fetches so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Read-receipt writes so far, including conflicts.
    pub fn receipt_write_count(&self) -> usize {
        self.receipt_writes.load(Ordering::SeqCst)
    }

    /// Profile lookups so far.
    pub fn profile_lookup_count(&self) -> usize {
        self.profile_lookups.load(Ordering::SeqCst)
    }

    fn spawn_heartbeat(&self, tx: mpsc::UnboundedSender<FeedFrame>, cancel: CancellationToken) {
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(FeedFrame::Heartbeat).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn subscribe(
        &self,
        scope: &Scope,
        filter: EventFilter,
    ) -> BackendResult<FeedSubscription> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let mode = self.state.lock().push_mode;
        if mode == PushMode::Refuse {
            return Err(BackendError::Refused(format!("push refused for {scope}")));
        }

        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let silent = mode != PushMode::Normal;

        if mode == PushMode::Normal {
            let _ = tx.send(FeedFrame::Ack);
        }
        if mode != PushMode::Silent {
            self.spawn_heartbeat(tx.clone(), cancel.clone());
        }

        self.state.lock().listeners.insert(
            id,
            Listener {
                scope: scope.clone(),
                filter,
                silent,
                tx,
                cancel,
            },
        );
        debug!(subscription = %id, scope = %scope, ?mode, "push subscription opened");

        Ok(FeedSubscription {
            id,
            frames: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(listener) = self.state.lock().listeners.remove(&id) {
            listener.cancel.cancel();
            debug!(subscription = %id, "push subscription released");
        }
    }

    async fn fetch_records(&self, scope: &Scope) -> BackendResult<Vec<Record>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (delay, fail) = {
            let mut state = self.state.lock();
            let fail = state.failing_fetches > 0;
            if fail {
                state.failing_fetches -= 1;
            }
            (state.fetch_delay, fail)
        };

        if !delay.is_zero() {
            time::sleep(delay).await;
        }
        if fail {
            return Err(BackendError::Unavailable(format!(
                "injected fetch failure for {scope}"
            )));
        }
        Ok(self.state.lock().scope_records(scope))
    }

    async fn write_read_receipt(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> BackendResult<ReadReceiptAck> {
        self.receipt_writes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if state.pending_conflicts > 0 {
            state.pending_conflicts -= 1;
            return Err(BackendError::Conflict(format!(
                "concurrent update on conversation {conversation_id}"
            )));
        }
        if !state.conversations.contains_key(&conversation_id) {
            return Err(BackendError::NotFound(format!(
                "conversation {conversation_id}"
            )));
        }

        let mut flipped: Vec<Record> = state
            .messages
            .values_mut()
            .filter(|m| m.parent_id == conversation_id && m.is_unread_for(reader_id))
            .map(|m| {
                m.read = true;
                m.clone()
            })
            .collect();
        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            conversation.unread.insert(reader_id, 0);
        }

        flipped.sort_by_key(Record::key);
        for record in &flipped {
            state.notify_message(&ChangeEvent::update(record.clone()));
        }
        info!(%conversation_id, %reader_id, marked = flipped.len(), "read receipt applied");

        Ok(ReadReceiptAck {
            marked: u32::try_from(flipped.len()).unwrap_or(u32::MAX),
        })
    }

    async fn post_message(&self, draft: &MessageDraft) -> BackendResult<Record> {
        let mut state = self.state.lock();
        if state.failing_posts > 0 {
            state.failing_posts -= 1;
            return Err(BackendError::Unavailable("injected post failure".to_string()));
        }
        state.insert_message(
            draft.conversation_id,
            draft.sender_id,
            draft.payload.clone(),
            Some(draft.client_ref),
        )
    }

    async fn fetch_profile(&self, user_id: Uuid) -> BackendResult<SenderProfile> {
        self.profile_lookups.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .profiles
            .get(&user_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("profile {user_id}")))
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend")
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("active_subscriptions", &self.active_subscriptions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use shared::models::ChangeKind;

    fn pair() -> (Uuid, Uuid) {
        (Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn inserts_bump_other_participants_counter() {
        let backend = InMemoryBackend::new();
        let (buyer, seller) = pair();
        let conversation = backend.create_conversation(buyer, seller);

        backend
            .insert_message(conversation, seller, json!({"content": "hi"}))
            .unwrap();
        backend
            .insert_message(conversation, seller, json!({"content": "still there?"}))
            .unwrap();
        backend
            .insert_message(conversation, buyer, json!({"content": "yes"}))
            .unwrap();

        assert_eq!(backend.unread_count(conversation, buyer), 2);
        assert_eq!(backend.unread_count(conversation, seller), 1);
        assert!(backend.counters_consistent(conversation));
    }

    #[test]
    fn creation_times_are_strictly_increasing() {
        let backend = InMemoryBackend::new();
        let (buyer, seller) = pair();
        let conversation = backend.create_conversation(buyer, seller);
        for n in 0..20 {
            backend
                .insert_message(conversation, seller, json!({"content": n}))
                .unwrap();
        }

        let records = backend.records(&Scope::Conversation(conversation));
        assert_eq!(records.len(), 20);
        assert!(records.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }

    #[test]
    fn deleting_unread_message_decrements_counter() {
        let backend = InMemoryBackend::new();
        let (buyer, seller) = pair();
        let conversation = backend.create_conversation(buyer, seller);
        let record = backend
            .insert_message(conversation, seller, json!("hello"))
            .unwrap();

        backend.delete_message(record.id).unwrap();

        assert_eq!(backend.unread_count(conversation, buyer), 0);
        assert!(backend.counters_consistent(conversation));
    }

    #[test]
    fn inbox_scope_holds_only_inbound_messages() {
        let backend = InMemoryBackend::new();
        let (buyer, seller) = pair();
        let conversation = backend.create_conversation(buyer, seller);
        let other = backend.create_conversation(Uuid::new_v4(), seller);

        backend.insert_message(conversation, seller, json!("in")).unwrap();
        backend.insert_message(conversation, buyer, json!("out")).unwrap();
        backend.insert_message(other, seller, json!("elsewhere")).unwrap();

        let inbox = backend.records(&Scope::Inbox(buyer));
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].payload, json!("in"));
    }

    #[tokio::test]
    async fn read_receipt_flips_flags_and_zeroes_counter() {
        let backend = InMemoryBackend::new();
        let (buyer, seller) = pair();
        let conversation = backend.create_conversation(buyer, seller);
        for text in ["a", "b", "c"] {
            backend.insert_message(conversation, seller, json!(text)).unwrap();
        }

        let ack = backend
            .write_read_receipt(conversation, buyer)
            .await
            .unwrap();

        assert_eq!(ack.marked, 3);
        assert_eq!(backend.unread_count(conversation, buyer), 0);
        assert!(
            backend
                .records(&Scope::Conversation(conversation))
                .iter()
                .all(|r| r.read)
        );

        let again = backend
            .write_read_receipt(conversation, buyer)
            .await
            .unwrap();
        assert_eq!(again.marked, 0);
    }

    #[tokio::test]
    async fn injected_conflicts_are_consumed_in_order() {
        let backend = InMemoryBackend::new();
        let (buyer, seller) = pair();
        let conversation = backend.create_conversation(buyer, seller);
        backend.conflict_next_receipts(1);

        let first = backend.write_read_receipt(conversation, buyer).await;
        assert!(first.unwrap_err().is_conflict());
        assert!(backend.write_read_receipt(conversation, buyer).await.is_ok());
        assert_eq!(backend.receipt_write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn live_subscription_acks_delivers_and_heartbeats() {
        let backend = InMemoryBackend::with_heartbeat_interval(Duration::from_secs(1));
        let (buyer, seller) = pair();
        let conversation = backend.create_conversation(buyer, seller);

        let mut sub = backend
            .subscribe(&Scope::Conversation(conversation), EventFilter::all())
            .await
            .unwrap();
        assert_eq!(sub.frames.next().await, Some(FeedFrame::Ack));

        let record = backend
            .insert_message(conversation, seller, json!("hi"))
            .unwrap();
        assert_eq!(
            sub.frames.next().await,
            Some(FeedFrame::Change(ChangeEvent::insert(record)))
        );
        assert_eq!(sub.frames.next().await, Some(FeedFrame::Heartbeat));

        backend.unsubscribe(sub.id);
        backend.unsubscribe(sub.id);
        assert_eq!(sub.frames.next().await, None);
        assert_eq!(backend.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn filter_drops_unrequested_kinds() {
        let backend = InMemoryBackend::new();
        let (buyer, seller) = pair();
        let conversation = backend.create_conversation(buyer, seller);
        let mut sub = backend
            .subscribe(&Scope::Inbox(buyer), EventFilter::inserts_only())
            .await
            .unwrap();
        assert_eq!(sub.frames.next().await, Some(FeedFrame::Ack));

        let record = backend
            .insert_message(conversation, seller, json!("one"))
            .unwrap();
        backend.update_message(record.id, json!("edited")).unwrap();
        let second = backend
            .insert_message(conversation, seller, json!("two"))
            .unwrap();

        let first = sub.frames.next().await;
        let next = sub.frames.next().await;
        assert!(matches!(first, Some(FeedFrame::Change(e)) if e.kind == ChangeKind::Insert));
        assert!(matches!(next, Some(FeedFrame::Change(e)) if e.record.id == second.id));
    }

    #[tokio::test]
    async fn push_modes_and_failures() {
        let backend = InMemoryBackend::new();
        let scope = Scope::Feed("active".into());

        backend.set_push_mode(PushMode::Refuse);
        assert!(matches!(
            backend.subscribe(&scope, EventFilter::all()).await,
            Err(BackendError::Refused(_))
        ));

        backend.set_push_mode(PushMode::Normal);
        let mut sub = backend.subscribe(&scope, EventFilter::all()).await.unwrap();
        assert_eq!(sub.frames.next().await, Some(FeedFrame::Ack));

        backend.fail_push("500", "boom");
        assert!(matches!(sub.frames.next().await, Some(FeedFrame::Error(e)) if e.code == "500"));
        assert_eq!(sub.frames.next().await, None);
    }

    #[tokio::test]
    async fn listing_status_change_leaves_feed() {
        let backend = InMemoryBackend::new();
        let owner = Uuid::new_v4();
        let mut sub = backend
            .subscribe(&Scope::Feed("active".into()), EventFilter::all())
            .await
            .unwrap();
        assert_eq!(sub.frames.next().await, Some(FeedFrame::Ack));

        let listing = backend.publish_listing(owner, "Bike", "active");
        backend.set_listing_status(listing.id, "sold").unwrap();

        let kinds: Vec<ChangeKind> = [sub.frames.next().await, sub.frames.next().await]
            .into_iter()
            .map(|frame| match frame {
                Some(FeedFrame::Change(event)) => event.kind,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Delete]);
        assert!(backend.records(&Scope::Feed("active".into())).is_empty());
        assert_eq!(backend.records(&Scope::Feed("sold".into())).len(), 1);
    }

    #[tokio::test]
    async fn injected_fetch_failures_then_recovery() {
        let backend = InMemoryBackend::new();
        let scope = Scope::Feed("active".into());
        backend.fail_next_fetches(2);

        assert!(backend.fetch_records(&scope).await.is_err());
        assert!(backend.fetch_records(&scope).await.is_err());
        assert!(backend.fetch_records(&scope).await.is_ok());
        assert_eq!(backend.fetch_count(), 3);
    }
}
