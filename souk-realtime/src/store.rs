//! Merge & dedup store.
//!
//! One ordered, id-unique cache per subscription. Push changes are applied
//! incrementally; poll results arrive as full-replace batches reconciled by
//! set difference. Every batch is applied under one lock and published as a
//! single snapshot, so readers never see a half-applied batch.
//!
//! Full-replace batches carry the store version observed when their fetch
//! started. Records changed incrementally after that point are newer than
//! the fetch and are left alone, and records deleted after it are not brought
//! back.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;
use shared::models::{ChangeEvent, ChangeKind, Record, RecordKey, Scope};
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};
use uuid::Uuid;

const ARRIVALS_CAPACITY: usize = 256;

/// Immutable view handed to consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    /// Ordered by `(created_at, id)`, unique by id
    pub records: Vec<Record>,
    /// Store version at publish time
    pub version: u64,
    /// True once the first full record set has been applied
    pub loaded: bool,
}

impl StoreSnapshot {
    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the view holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&Record> {
        self.records.iter().find(|record| record.id == id)
    }

    /// Record ids in display order.
    #[must_use]
    pub fn ids(&self) -> Vec<Uuid> {
        self.records.iter().map(|record| record.id).collect()
    }

    /// Unread-from-others count for one participant, derived from the flags.
    #[must_use]
    pub fn unread_for(&self, participant: Uuid) -> usize {
        self.records
            .iter()
            .filter(|record| !record.pending && record.is_unread_for(participant))
            .count()
    }

    /// Unread counts per parent, for inbox views spanning conversations.
    #[must_use]
    pub fn unread_by_parent(&self, participant: Uuid) -> BTreeMap<Uuid, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            if !record.pending && record.is_unread_for(participant) {
                *counts.entry(record.parent_id).or_default() += 1;
            }
        }
        counts
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<RecordKey, Record>,
    index: HashMap<Uuid, RecordKey>,
    /// client_ref -> temporary id of the optimistic entry
    pending_refs: HashMap<Uuid, Uuid>,
    /// id -> version of the last incremental change
    touched: HashMap<Uuid, u64>,
    /// id -> version of the incremental delete
    tombstones: HashMap<Uuid, u64>,
    version: u64,
    last_replace: Option<u64>,
    loaded: bool,
    sealed: bool,
}

impl Inner {
    fn upsert(&mut self, record: Record) -> Option<Record> {
        let previous = self.remove(record.id);
        let key = record.key();
        self.index.insert(record.id, key);
        self.entries.insert(key, record);
        previous
    }

    fn remove(&mut self, id: Uuid) -> Option<Record> {
        let key = self.index.remove(&id)?;
        let record = self.entries.remove(&key)?;
        if let Some(client_ref) = record.client_ref
            && record.pending
        {
            self.pending_refs.remove(&client_ref);
        }
        Some(record)
    }

    fn get(&self, id: Uuid) -> Option<&Record> {
        self.index.get(&id).and_then(|key| self.entries.get(key))
    }

    /// Drops the optimistic twin of a server record, if any.
    fn reconcile_pending(&mut self, record: &Record) -> bool {
        let Some(client_ref) = record.client_ref else {
            return false;
        };
        match self.pending_refs.remove(&client_ref) {
            Some(temp_id) if temp_id != record.id => self.remove(temp_id).is_some(),
            _ => false,
        }
    }

    fn touch(&mut self, id: Uuid) {
        self.touched.insert(id, self.version + 1);
    }

    fn changed_after(&self, id: Uuid, as_of: u64) -> bool {
        self.touched.get(&id).is_some_and(|version| *version > as_of)
    }

    fn deleted_after(&self, id: Uuid, as_of: u64) -> bool {
        self.tombstones.get(&id).is_some_and(|version| *version > as_of)
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            records: self.entries.values().cloned().collect(),
            version: self.version,
            loaded: self.loaded,
        }
    }
}

/// Ordered, id-unique record cache fed by both transports.
pub struct MergeStore {
    scope: Scope,
    inner: Mutex<Inner>,
    mutations: AtomicU64,
    snapshots: watch::Sender<Arc<StoreSnapshot>>,
    arrivals: broadcast::Sender<Record>,
}

impl MergeStore {
    /// Empty, unloaded store for `scope`.
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(StoreSnapshot::default()));
        let (arrivals, _) = broadcast::channel(ARRIVALS_CAPACITY);
        Self {
            scope,
            inner: Mutex::new(Inner::default()),
            mutations: AtomicU64::new(0),
            snapshots,
            arrivals,
        }
    }

    /// Scope this store caches.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Current version; full-replace fetches record it when they start.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.snapshots.subscribe()
    }

    /// Records that appeared after the initial load, or through push at any
    /// time. Own optimistic entries are not included.
    #[must_use]
    pub fn arrivals(&self) -> broadcast::Receiver<Record> {
        self.arrivals.subscribe()
    }

    /// Number of applied batches. Does not move once sealed.
    #[must_use]
    pub fn mutation_count(&self) -> u64 {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Whether a full record set has been applied.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.inner.lock().loaded
    }

    /// Whether the owning subscription has closed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    /// Resolves once the first full record set has been applied.
    pub async fn wait_loaded(&self) {
        let mut rx = self.watch();
        let _ = rx.wait_for(|snapshot| snapshot.loaded).await;
    }

    /// Stops all further ingestion. Late responses become no-ops.
    pub fn seal(&self) {
        let mut inner = self.inner.lock();
        if !inner.sealed {
            inner.sealed = true;
            debug!(scope = %self.scope, version = inner.version, "store sealed");
        }
    }

    fn commit(&self, inner: &mut Inner) {
        inner.version += 1;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.snapshots.send_replace(Arc::new(inner.snapshot()));
    }

    /// Applies one push change. Returns whether the visible set changed.
    pub fn apply_change(&self, event: ChangeEvent) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }

        let ChangeEvent { kind, record } = event;
        let id = record.id;
        let changed = match kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let replaced_pending = inner.reconcile_pending(&record);
                let unchanged = inner.get(id).map(|existing| *existing == record);
                match unchanged {
                    Some(same) if kind == ChangeKind::Insert || same => {
                        trace!(scope = %self.scope, %id, "duplicate change ignored");
                        replaced_pending
                    }
                    existing => {
                        let is_new = existing.is_none() && !replaced_pending;
                        inner.tombstones.remove(&id);
                        inner.touch(id);
                        inner.upsert(record.clone());
                        if is_new {
                            let _ = self.arrivals.send(record);
                        }
                        true
                    }
                }
            }
            ChangeKind::Delete => {
                let version = inner.version + 1;
                inner.tombstones.insert(id, version);
                inner.touched.remove(&id);
                inner.remove(id).is_some()
            }
        };

        if changed {
            self.commit(&mut inner);
        }
        changed
    }

    /// Reconciles the store against a point-in-time server set.
    ///
    /// `as_of` is the store version read when the fetch started. Returns
    /// whether the visible set changed.
    pub fn apply_snapshot(&self, records: Vec<Record>, as_of: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        if inner.last_replace.is_some_and(|last| as_of < last) {
            debug!(scope = %self.scope, as_of, "out of date full set ignored");
            return false;
        }

        let server_ids: HashSet<Uuid> = records.iter().map(|record| record.id).collect();
        let server_refs: HashSet<Uuid> = records.iter().filter_map(|r| r.client_ref).collect();
        let mut changed = false;

        let stale: Vec<Uuid> = inner
            .entries
            .values()
            .filter(|record| {
                if record.pending {
                    record
                        .client_ref
                        .is_some_and(|client_ref| server_refs.contains(&client_ref))
                } else {
                    !server_ids.contains(&record.id) && !inner.changed_after(record.id, as_of)
                }
            })
            .map(|record| record.id)
            .collect();
        for id in stale {
            changed |= inner.remove(id).is_some();
        }

        let announce = inner.loaded;
        for record in records {
            let id = record.id;
            if inner.deleted_after(id, as_of) || inner.changed_after(id, as_of) {
                continue;
            }
            match inner.get(id).map(|existing| *existing == record) {
                Some(true) => {}
                existing => {
                    let is_new = existing.is_none();
                    inner.upsert(record.clone());
                    if is_new && announce {
                        let _ = self.arrivals.send(record);
                    }
                    changed = true;
                }
            }
        }

        inner.touched.retain(|_, version| *version > as_of);
        inner.tombstones.retain(|_, version| *version > as_of);
        inner.last_replace = Some(as_of);

        let first_load = !inner.loaded;
        inner.loaded = true;
        if changed || first_load {
            self.commit(&mut inner);
        }
        debug!(scope = %self.scope, as_of, changed, size = inner.entries.len(), "full set reconciled");
        changed
    }

    /// Shows the sender's own record before the server acknowledges it.
    pub fn insert_optimistic(&self, mut record: Record) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        let Some(client_ref) = record.client_ref else {
            return false;
        };
        record.pending = true;
        inner.pending_refs.insert(client_ref, record.id);
        inner.touch(record.id);
        inner.upsert(record);
        self.commit(&mut inner);
        true
    }

    /// Removes an optimistic entry whose write failed.
    pub fn discard_optimistic(&self, client_ref: Uuid) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }
        let Some(temp_id) = inner.pending_refs.get(&client_ref).copied() else {
            return false;
        };
        let removed = inner.remove(temp_id).is_some();
        if removed {
            self.commit(&mut inner);
        }
        removed
    }

    /// Key of the newest record, used to bound a later `mark_read`.
    #[must_use]
    pub fn last_key(&self) -> Option<RecordKey> {
        self.inner.lock().entries.keys().next_back().copied()
    }

    /// Flags records from others as read for `reader` in one batch, limited
    /// to keys up to `through` when given.
    pub fn mark_read(&self, reader: Uuid, through: Option<RecordKey>) -> usize {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return 0;
        }
        let ids: Vec<Uuid> = inner
            .entries
            .iter()
            .filter(|(key, _)| through.is_none_or(|limit| **key <= limit))
            .map(|(_, record)| record)
            .filter(|record| !record.pending && record.is_unread_for(reader))
            .map(|record| record.id)
            .collect();
        if ids.is_empty() {
            return 0;
        }

        for id in &ids {
            if let Some(key) = inner.index.get(id).copied()
                && let Some(record) = inner.entries.get_mut(&key)
            {
                record.read = true;
            }
            inner.touch(*id);
        }
        self.commit(&mut inner);
        ids.len()
    }

    /// Unread-from-others count for `reader`.
    #[must_use]
    pub fn unread_for(&self, reader: Uuid) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|record| !record.pending && record.is_unread_for(reader))
            .count()
    }
}

impl std::fmt::Debug for MergeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeStore")
            .field("scope", &self.scope)
            .field("version", &self.version())
            .field("mutations", &self.mutation_count())
            .finish_non_exhaustive()
    }
}
