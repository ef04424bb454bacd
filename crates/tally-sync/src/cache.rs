//! In-memory store of paged collections.
//!
//! The store is the only owner of cached pages. Every mutation goes through
//! [`CacheStore::patch_matching`], [`CacheStore::set_pages`] or
//! [`CacheStore::restore`], all of which hold a store-wide write lock for the
//! duration of one logical update, so two transforms never interleave.
//! Reads go straight to the underlying `DashMap`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::key::{CacheKey, KeyPredicate};
use crate::types::{EntityId, Page, Record};

/// Broadcast channel capacity for cache events.
const BROADCAST_CHANNEL_CAPACITY: usize = 4096;

/// Which collections an invalidation or patch reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Only collections currently observed by a visible view.
    Active,
    /// Every matching collection, including background ones.
    All,
}

/// An ordered sequence of pages for one key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CachedCollection {
    pub pages: Vec<Page>,
    /// Page numbers that produced `pages`, in order.
    pub page_params: Vec<u32>,
}

impl CachedCollection {
    pub fn from_pages(pages: Vec<Page>) -> Self {
        let page_params = pages.iter().map(|p| p.page_number).collect();
        Self { pages, page_params }
    }

    pub fn first_page(&self) -> Option<&Page> {
        self.pages.first()
    }

    /// All items in page order.
    pub fn items(&self) -> impl Iterator<Item = &Record> {
        self.pages.iter().flat_map(|p| p.items.iter())
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.items().filter_map(Record::id).collect()
    }

    pub fn find(&self, id: EntityId) -> Option<&Record> {
        self.items().find(|r| r.id() == Some(id))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.find(id).is_some()
    }

    /// Total reported by the first page, if the server sent one.
    pub fn total(&self) -> Option<u64> {
        self.first_page().and_then(|p| p.total)
    }

    /// Next page to request for incremental fetching.
    pub fn next_page_param(&self) -> Option<u32> {
        self.pages.last().and_then(Page::next_page)
    }

    /// True if no page holds the same id twice.
    pub fn pages_unique(&self) -> bool {
        self.pages.iter().all(|page| {
            let mut seen = HashSet::new();
            page.items
                .iter()
                .filter_map(Record::id)
                .all(|id| seen.insert(id))
        })
    }
}

/// State recorded before a patch touched a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub key: CacheKey,
    /// `None` if the collection did not exist before the patch.
    pub previous: Option<CachedCollection>,
}

/// Notification for store subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// A collection's contents changed.
    Updated { key: CacheKey },
    /// A collection was marked stale.
    Invalidated { key: CacheKey },
    /// An observed collection should be refetched now.
    RefetchRequested { key: CacheKey },
    /// A collection was dropped from the store.
    Removed { key: CacheKey },
}

#[derive(Debug, Default)]
struct CacheEntry {
    collection: Option<CachedCollection>,
    stale: bool,
    observers: usize,
    updated_at: Option<DateTime<Utc>>,
}

/// Process-wide store of cached collections.
pub struct CacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
    /// Serializes writers so one logical update is applied atomically.
    write_lock: Mutex<()>,
    events_tx: broadcast::Sender<CacheEvent>,
}

impl CacheStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe to store events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events_tx.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // A panicking transform leaves no partial state behind: entries are
        // only written after the transform returns.
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn broadcast(&self, event: CacheEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("no subscribers for cache event");
        }
    }

    /// Current collection for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<CachedCollection> {
        self.entries.get(key).and_then(|e| e.collection.clone())
    }

    pub fn updated_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).and_then(|e| e.updated_at)
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.stale)
    }

    /// Whether a visible view currently observes `key`.
    pub fn is_active(&self, key: &CacheKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.observers > 0)
    }

    /// Keys that currently hold data.
    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.value().collection.is_some())
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of collections holding data.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().collection.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace a collection wholesale, after a full (re)fetch.
    pub fn set_pages(&self, key: CacheKey, pages: Vec<Page>) {
        let _guard = self.lock();
        let mut entry = self.entries.entry(key.clone()).or_default();
        entry.collection = Some(CachedCollection::from_pages(pages));
        entry.stale = false;
        entry.updated_at = Some(Utc::now());
        drop(entry);
        trace!(key = %key, "cache: pages replaced");
        self.broadcast(CacheEvent::Updated { key });
    }

    /// Append a page fetched incrementally.
    ///
    /// Items already present on an earlier page are dropped from the new page,
    /// which happens when rows shift between page requests.
    pub fn append_page(&self, key: CacheKey, mut page: Page) {
        let _guard = self.lock();
        let mut entry = self.entries.entry(key.clone()).or_default();
        let collection = entry.collection.get_or_insert_with(CachedCollection::default);
        let seen: HashSet<EntityId> = collection.items().filter_map(Record::id).collect();
        page.items
            .retain(|r| r.id().is_none_or(|id| !seen.contains(&id)));
        collection.page_params.push(page.page_number);
        collection.pages.push(page);
        entry.updated_at = Some(Utc::now());
        drop(entry);
        trace!(key = %key, "cache: page appended");
        self.broadcast(CacheEvent::Updated { key });
    }

    /// Apply `transform` to every collection whose key matches `predicate`.
    ///
    /// `transform` returns `None` to leave a collection unchanged. For an
    /// [`KeyPredicate::Exact`] predicate on a key with no data, `transform`
    /// is called once with `None`. Returns a snapshot of every collection
    /// that actually changed, in application order.
    pub fn patch_matching<F>(
        &self,
        predicate: &KeyPredicate,
        scope: Scope,
        mut transform: F,
    ) -> Vec<Snapshot>
    where
        F: FnMut(&CacheKey, Option<&CachedCollection>) -> Option<CachedCollection>,
    {
        let _guard = self.lock();

        let mut targets: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.key().matches(predicate))
            .filter(|e| scope == Scope::All || e.value().observers > 0)
            .filter(|e| e.value().collection.is_some())
            .map(|e| e.key().clone())
            .collect();
        targets.sort();

        if let KeyPredicate::Exact(key) = predicate
            && targets.is_empty()
            && (scope == Scope::All || self.is_active(key))
        {
            targets.push(key.clone());
        }

        let mut touched = Vec::new();
        for key in targets {
            let previous = self.get(&key);
            let Some(next) = transform(&key, previous.as_ref()) else {
                continue;
            };
            let mut entry = self.entries.entry(key.clone()).or_default();
            entry.collection = Some(next);
            entry.updated_at = Some(Utc::now());
            drop(entry);
            trace!(key = %key, "cache: collection patched");
            self.broadcast(CacheEvent::Updated { key: key.clone() });
            touched.push(Snapshot { key, previous });
        }
        touched
    }

    /// Put every snapshotted collection back to its recorded state.
    ///
    /// Snapshots are restored in reverse order so that a key touched twice
    /// ends up at its earliest recorded state.
    pub fn restore(&self, snapshots: &[Snapshot]) {
        let _guard = self.lock();
        for snapshot in snapshots.iter().rev() {
            let key = snapshot.key.clone();
            match &snapshot.previous {
                Some(previous) => {
                    let mut entry = self.entries.entry(key.clone()).or_default();
                    entry.collection = Some(previous.clone());
                    entry.updated_at = Some(Utc::now());
                    drop(entry);
                    self.broadcast(CacheEvent::Updated { key });
                }
                None => {
                    let drop_entry = match self.entries.get_mut(&key) {
                        Some(mut entry) => {
                            entry.collection = None;
                            entry.observers == 0
                        }
                        None => false,
                    };
                    if drop_entry {
                        self.entries.remove(&key);
                    }
                    self.broadcast(CacheEvent::Removed { key });
                }
            }
        }
        debug!(count = snapshots.len(), "cache: snapshots restored");
    }

    /// Mark matching collections stale and schedule refetches.
    ///
    /// With [`Scope::Active`] only observed collections are touched. With
    /// [`Scope::All`] background collections are marked stale as well and
    /// refetch when next observed. Returns the keys marked stale.
    pub fn invalidate(&self, predicate: &KeyPredicate, scope: Scope) -> Vec<CacheKey> {
        let _guard = self.lock();
        let mut marked = Vec::new();
        let mut refetch = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if !entry.key().matches(predicate) {
                continue;
            }
            let active = entry.observers > 0;
            if scope == Scope::Active && !active {
                continue;
            }
            entry.stale = true;
            marked.push(entry.key().clone());
            if active {
                refetch.push(entry.key().clone());
            }
        }
        marked.sort();
        refetch.sort();

        for key in &marked {
            self.broadcast(CacheEvent::Invalidated { key: key.clone() });
        }
        for key in refetch {
            debug!(key = %key, "cache: refetch scheduled");
            self.broadcast(CacheEvent::RefetchRequested { key });
        }
        marked
    }

    /// Drop matching collections entirely.
    pub fn remove(&self, predicate: &KeyPredicate) {
        let _guard = self.lock();
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.key().matches(predicate))
            .map(|e| e.key().clone())
            .collect();
        for key in keys {
            if let Some(mut entry) = self.entries.get_mut(&key) {
                entry.collection = None;
                entry.stale = false;
            }
            self.entries.remove_if(&key, |_, e| e.observers == 0);
            self.broadcast(CacheEvent::Removed { key });
        }
    }

    /// Clear all cached data. Observers are kept.
    pub fn clear(&self) {
        let _guard = self.lock();
        self.entries.retain(|_, e| e.observers > 0);
        for mut entry in self.entries.iter_mut() {
            entry.collection = None;
            entry.stale = false;
        }
        debug!("cache cleared");
    }

    /// Register a visible view of `key`.
    pub fn observe(self: &Arc<Self>, key: CacheKey) -> ViewGuard {
        let needs_fetch = {
            let mut entry = self.entries.entry(key.clone()).or_default();
            entry.observers += 1;
            entry.stale || entry.collection.is_none()
        };
        trace!(key = %key, "cache: view attached");
        ViewGuard {
            store: Arc::clone(self),
            key,
            needs_fetch,
        }
    }

    fn release(&self, key: &CacheKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.observers = entry.observers.saturating_sub(1);
        }
        self.entries
            .remove_if(key, |_, e| e.observers == 0 && e.collection.is_none());
        trace!(key = %key, "cache: view detached");
    }

    /// Copy of every collection with data, for mirroring.
    pub fn export(&self) -> Vec<(CacheKey, CachedCollection)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter_map(|e| {
                e.value()
                    .collection
                    .clone()
                    .map(|c| (e.key().clone(), c))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Seed collections from a mirror. Seeded data is marked stale so the
    /// first observer refetches it.
    pub fn import(&self, collections: Vec<(CacheKey, CachedCollection)>) {
        let _guard = self.lock();
        for (key, collection) in collections {
            let mut entry = self.entries.entry(key).or_default();
            if entry.collection.is_none() {
                entry.collection = Some(collection);
                entry.stale = true;
            }
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        let (events_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            write_lock: Mutex::new(()),
            events_tx,
        }
    }
}

/// Keeps a key active while alive.
pub struct ViewGuard {
    store: Arc<CacheStore>,
    key: CacheKey,
    needs_fetch: bool,
}

impl ViewGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// True if the key was stale or empty when the view attached.
    pub fn needs_fetch(&self) -> bool {
        self.needs_fetch
    }

    pub fn collection(&self) -> Option<CachedCollection> {
        self.store.get(&self.key)
    }
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        self.store.release(&self.key);
    }
}

impl std::fmt::Debug for ViewGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewGuard").field("key", &self.key).finish()
    }
}
