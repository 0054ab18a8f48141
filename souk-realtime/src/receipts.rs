//! Read-receipt synchronizer.
//!
//! `mark_read` issues one server write that flips the read flags and zeroes
//! the reader's unread counter together, then applies the same flip to the
//! local store in one batch. A lost write race is retried once and then
//! dropped; the next event or poll corrects the view either way.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use metrics::counter;
use parking_lot::Mutex;
use shared::config::client::RealtimeSettings;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
    backend::SharedBackend,
    errors::{RealtimeError, RealtimeResult},
    store::MergeStore,
};

/// Result of one read-receipt call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkReadOutcome {
    /// Nothing unread locally; no write was issued
    NothingUnread,
    /// Server acknowledged; carries the number of records it flipped
    Marked(u32),
    /// Write conflicts outlasted the retry budget
    Dropped,
}

/// Issues read receipts and mirrors them into open conversation stores.
pub struct ReadReceiptSynchronizer {
    backend: SharedBackend,
    retries: u32,
    debounce: Duration,
    stores: Mutex<HashMap<Uuid, Weak<MergeStore>>>,
    scheduled: Mutex<HashSet<(Uuid, Uuid)>>,
    invocations: AtomicUsize,
}

impl ReadReceiptSynchronizer {
    /// Synchronizer using the retry and debounce settings.
    #[must_use]
    pub fn new(backend: SharedBackend, settings: &RealtimeSettings) -> Self {
        Self {
            backend,
            retries: settings.write_conflict_retries,
            debounce: settings.mark_read_debounce(),
            stores: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(HashSet::new()),
            invocations: AtomicUsize::new(0),
        }
    }

    /// Makes the open conversation's store the local target of receipts.
    pub fn register(&self, conversation_id: Uuid, store: &Arc<MergeStore>) {
        self.stores
            .lock()
            .insert(conversation_id, Arc::downgrade(store));
    }

    fn store_for(&self, conversation_id: Uuid) -> Option<Arc<MergeStore>> {
        let mut stores = self.stores.lock();
        let store = stores.get(&conversation_id).and_then(Weak::upgrade);
        match store {
            Some(store) if !store.is_sealed() => Some(store),
            _ => {
                stores.remove(&conversation_id);
                None
            }
        }
    }

    /// Number of `mark_read` calls so far, including no-ops.
    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Marks every message from other participants read for `reader_id`.
    /// Skips the write when the open conversation's loaded store shows
    /// nothing unread.
    pub async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> RealtimeResult<MarkReadOutcome> {
        self.write(conversation_id, reader_id, false).await
    }

    /// Like [`mark_read`](Self::mark_read) but always writes. Used for a
    /// message learned of from another scope, which the conversation store
    /// may not have received yet.
    pub async fn mark_read_unconditionally(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
    ) -> RealtimeResult<MarkReadOutcome> {
        self.write(conversation_id, reader_id, true).await
    }

    #[instrument(skip(self), fields(%conversation_id, %reader_id))]
    async fn write(
        &self,
        conversation_id: Uuid,
        reader_id: Uuid,
        unconditional: bool,
    ) -> RealtimeResult<MarkReadOutcome> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let store = self.store_for(conversation_id);
        if !unconditional
            && let Some(store) = &store
            && store.is_loaded()
            && store.unread_for(reader_id) == 0
        {
            debug!("nothing unread; skipping write");
            return Ok(MarkReadOutcome::NothingUnread);
        }
        let through = store.as_ref().and_then(|store| store.last_key());

        let mut attempt = 0;
        loop {
            match self
                .backend
                .write_read_receipt(conversation_id, reader_id)
                .await
            {
                Ok(ack) => {
                    if let Some(store) = self.store_for(conversation_id) {
                        let flipped = store.mark_read(reader_id, through);
                        debug!(marked = ack.marked, flipped, "read receipt applied");
                    }
                    counter!("souk_realtime_read_receipts_total").increment(1);
                    return Ok(MarkReadOutcome::Marked(ack.marked));
                }
                Err(err) if err.is_conflict() && attempt < self.retries => {
                    attempt += 1;
                    debug!(attempt, error = %err, "read receipt lost a write race; retrying");
                }
                Err(err) if err.is_conflict() => {
                    counter!("souk_realtime_read_receipts_dropped_total").increment(1);
                    let conflict = RealtimeError::WriteConflict { conversation_id };
                    warn!(error = %conflict, cause = %err, "read receipt dropped");
                    return Ok(MarkReadOutcome::Dropped);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Debounced auto-read for a live inbound message. Requests for the same
    /// conversation and reader arriving within the window collapse into one
    /// unconditional write. Returns false when a call is already scheduled.
    pub fn request_mark_read(self: &Arc<Self>, conversation_id: Uuid, reader_id: Uuid) -> bool {
        if !self.scheduled.lock().insert((conversation_id, reader_id)) {
            return false;
        }
        let synchronizer = Arc::clone(self);
        tokio::spawn(async move {
            time::sleep(synchronizer.debounce).await;
            synchronizer
                .scheduled
                .lock()
                .remove(&(conversation_id, reader_id));
            if let Err(err) = synchronizer
                .mark_read_unconditionally(conversation_id, reader_id)
                .await
            {
                warn!(%conversation_id, error = %err, "debounced read receipt failed");
            }
        });
        true
    }

    /// Marks the conversation read once its view has loaded and stayed open
    /// for the debounce window. Cancelling the token abandons the request.
    pub fn mark_read_when_loaded(
        self: &Arc<Self>,
        conversation_id: Uuid,
        reader_id: Uuid,
        store: Arc<MergeStore>,
        cancel: CancellationToken,
    ) {
        let synchronizer = Arc::clone(self);
        tokio::spawn(async move {
            let settled = async {
                store.wait_loaded().await;
                time::sleep(synchronizer.debounce).await;
            };
            tokio::select! {
                () = cancel.cancelled() => return,
                () = settled => {}
            }
            if store.is_sealed() {
                return;
            }
            if let Err(err) = synchronizer.mark_read(conversation_id, reader_id).await {
                warn!(%conversation_id, error = %err, "read receipt for visible conversation failed");
            }
        });
    }
}

impl std::fmt::Debug for ReadReceiptSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadReceiptSynchronizer")
            .field("retries", &self.retries)
            .field("debounce", &self.debounce)
            .field("invocations", &self.invocation_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, InMemoryBackend};
    use serde_json::json;
    use shared::models::Scope;

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        synchronizer: Arc<ReadReceiptSynchronizer>,
        conversation: Uuid,
        buyer: Uuid,
        seller: Uuid,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::new());
        let (buyer, seller) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation = backend.create_conversation(buyer, seller);
        let shared: SharedBackend = backend.clone();
        let synchronizer = Arc::new(ReadReceiptSynchronizer::new(
            shared,
            &RealtimeSettings::default(),
        ));
        Fixture {
            backend,
            synchronizer,
            conversation,
            buyer,
            seller,
        }
    }

    fn loaded_store(fx: &Fixture) -> Arc<MergeStore> {
        let store = Arc::new(MergeStore::new(Scope::Conversation(fx.conversation)));
        store.apply_snapshot(fx.backend.records(&Scope::Conversation(fx.conversation)), 0);
        fx.synchronizer.register(fx.conversation, &store);
        store
    }

    #[tokio::test]
    async fn marks_server_and_local_store_together() {
        let fx = fixture();
        for text in ["a", "b", "c"] {
            fx.backend
                .insert_message(fx.conversation, fx.seller, json!(text))
                .unwrap();
        }
        let store = loaded_store(&fx);
        assert_eq!(store.unread_for(fx.buyer), 3);

        let outcome = fx
            .synchronizer
            .mark_read(fx.conversation, fx.buyer)
            .await
            .unwrap();

        assert_eq!(outcome, MarkReadOutcome::Marked(3));
        assert_eq!(fx.backend.unread_count(fx.conversation, fx.buyer), 0);
        assert_eq!(store.unread_for(fx.buyer), 0);
        assert!(fx.backend.counters_consistent(fx.conversation));
    }

    #[tokio::test]
    async fn nothing_unread_is_a_noop() {
        let fx = fixture();
        fx.backend
            .insert_message(fx.conversation, fx.buyer, json!("own message"))
            .unwrap();
        let _store = loaded_store(&fx);

        let outcome = fx
            .synchronizer
            .mark_read(fx.conversation, fx.buyer)
            .await
            .unwrap();

        assert_eq!(outcome, MarkReadOutcome::NothingUnread);
        assert_eq!(fx.backend.receipt_write_count(), 0);
    }

    #[tokio::test]
    async fn unconditional_write_ignores_a_stale_store() {
        let fx = fixture();
        let store = loaded_store(&fx);
        fx.backend
            .insert_message(fx.conversation, fx.seller, json!("not pushed yet"))
            .unwrap();
        assert_eq!(store.unread_for(fx.buyer), 0);

        let skipped = fx
            .synchronizer
            .mark_read(fx.conversation, fx.buyer)
            .await
            .unwrap();
        assert_eq!(skipped, MarkReadOutcome::NothingUnread);

        let written = fx
            .synchronizer
            .mark_read_unconditionally(fx.conversation, fx.buyer)
            .await
            .unwrap();
        assert_eq!(written, MarkReadOutcome::Marked(1));
        assert_eq!(fx.backend.unread_count(fx.conversation, fx.buyer), 0);
        assert!(fx.backend.counters_consistent(fx.conversation));
    }

    #[tokio::test]
    async fn conflict_is_retried_once_then_dropped() {
        let fx = fixture();
        fx.backend
            .insert_message(fx.conversation, fx.seller, json!("hi"))
            .unwrap();
        let _store = loaded_store(&fx);

        fx.backend.conflict_next_receipts(1);
        let retried = fx
            .synchronizer
            .mark_read(fx.conversation, fx.buyer)
            .await
            .unwrap();
        assert_eq!(retried, MarkReadOutcome::Marked(1));
        assert_eq!(fx.backend.receipt_write_count(), 2);

        fx.backend
            .insert_message(fx.conversation, fx.seller, json!("again"))
            .unwrap();
        let _store = loaded_store(&fx);
        fx.backend.conflict_next_receipts(2);
        let dropped = fx
            .synchronizer
            .mark_read(fx.conversation, fx.buyer)
            .await
            .unwrap();
        assert_eq!(dropped, MarkReadOutcome::Dropped);
        assert_eq!(fx.backend.receipt_write_count(), 4);
    }

    #[tokio::test]
    async fn other_backend_errors_propagate() {
        let fx = fixture();
        let result = fx.synchronizer.mark_read(Uuid::new_v4(), fx.buyer).await;

        assert!(matches!(
            result,
            Err(RealtimeError::Backend(BackendError::NotFound(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn requests_within_debounce_collapse() {
        let fx = fixture();
        fx.backend
            .insert_message(fx.conversation, fx.seller, json!("hi"))
            .unwrap();

        assert!(fx.synchronizer.request_mark_read(fx.conversation, fx.buyer));
        assert!(!fx.synchronizer.request_mark_read(fx.conversation, fx.buyer));
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fx.synchronizer.invocation_count(), 1);
        assert_eq!(fx.backend.unread_count(fx.conversation, fx.buyer), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn visible_request_waits_for_load_and_debounce() {
        let fx = fixture();
        fx.backend
            .insert_message(fx.conversation, fx.seller, json!("hi"))
            .unwrap();
        let store = Arc::new(MergeStore::new(Scope::Conversation(fx.conversation)));
        fx.synchronizer.register(fx.conversation, &store);
        fx.synchronizer.mark_read_when_loaded(
            fx.conversation,
            fx.buyer,
            Arc::clone(&store),
            CancellationToken::new(),
        );

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.synchronizer.invocation_count(), 0);

        store.apply_snapshot(fx.backend.records(&Scope::Conversation(fx.conversation)), 0);
        time::sleep(Duration::from_millis(499)).await;
        assert_eq!(fx.synchronizer.invocation_count(), 0);
        time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fx.synchronizer.invocation_count(), 1);
        assert_eq!(store.unread_for(fx.buyer), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_visible_request_never_writes() {
        let fx = fixture();
        let store = Arc::new(MergeStore::new(Scope::Conversation(fx.conversation)));
        let cancel = CancellationToken::new();
        fx.synchronizer.mark_read_when_loaded(
            fx.conversation,
            fx.buyer,
            Arc::clone(&store),
            cancel.clone(),
        );
        store.apply_snapshot(Vec::new(), 0);

        cancel.cancel();
        time::sleep(Duration::from_secs(1)).await;

        assert_eq!(fx.synchronizer.invocation_count(), 0);
    }
}
