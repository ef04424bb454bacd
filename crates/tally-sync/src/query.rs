//! Fetch coordination: filling the store from a [`PageSource`] and
//! answering refetch requests.
//!
//! Each key has at most one fetch in flight. Starting another fetch for the
//! same key cancels the previous one; its response, if it still arrives, is
//! discarded without touching the store.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::SyncError;
use crate::cache::{CacheEvent, CacheStore, CachedCollection, ViewGuard};
use crate::key::CacheKey;
use crate::types::Page;

/// Remote list endpoint.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetch page `page` (1-based) of the collection behind `key`.
    ///
    /// Implementations should stop early once `cancel` fires; the caller
    /// discards the result either way.
    async fn fetch_page(
        &self,
        key: &CacheKey,
        page: u32,
        cancel: CancellationToken,
    ) -> Result<Page, SyncError>;
}

/// A visible view of one key. The key stays active until this is dropped.
pub struct ViewHandle {
    guard: ViewGuard,
    events: broadcast::Receiver<CacheEvent>,
}

impl ViewHandle {
    pub fn key(&self) -> &CacheKey {
        self.guard.key()
    }

    pub fn collection(&self) -> Option<CachedCollection> {
        self.guard.collection()
    }

    /// Wait until this key's collection changes. Returns `None` once the
    /// store is gone.
    pub async fn changed(&mut self) -> Option<CachedCollection> {
        loop {
            match self.events.recv().await {
                Ok(CacheEvent::Updated { key }) if &key == self.guard.key() => {
                    return self.guard.collection();
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, key = %self.guard.key(), "view lagged behind cache events");
                    return self.guard.collection();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl std::fmt::Debug for ViewHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle")
            .field("key", self.guard.key())
            .finish()
    }
}

/// Fills the store from a [`PageSource`].
pub struct QueryClient {
    store: Arc<CacheStore>,
    source: Arc<dyn PageSource>,
    in_flight: DashMap<CacheKey, (u64, CancellationToken)>,
    generation: AtomicU64,
}

impl QueryClient {
    pub fn new(store: Arc<CacheStore>, source: Arc<dyn PageSource>) -> Arc<Self> {
        Arc::new(Self {
            store,
            source,
            in_flight: DashMap::new(),
            generation: AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Number of keys with a fetch in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run `op` as the only fetch for `key`. `Ok(None)` if it was superseded.
    async fn exclusive<T, F, Fut>(&self, key: &CacheKey, op: F) -> Result<Option<T>, SyncError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        if let Some((_, previous)) = self
            .in_flight
            .insert(key.clone(), (generation, token.clone()))
        {
            trace!(key = %key, "superseding in-flight fetch");
            previous.cancel();
        }

        let call = op(token.clone());
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::Cancelled),
            result = call => result,
        };
        self.in_flight.remove_if(key, |_, (g, _)| *g == generation);

        match result {
            _ if token.is_cancelled() => {
                debug!(key = %key, "fetch superseded, result discarded");
                Ok(None)
            }
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_cancellation() => Ok(None),
            Err(e) => {
                warn!(key = %key, error = %e, "fetch failed");
                Err(e)
            }
        }
    }

    /// Fetch the first page and replace whatever the key held.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Option<CachedCollection>, SyncError> {
        let source = Arc::clone(&self.source);
        let page = self
            .exclusive(key, |cancel| async move { source.fetch_page(key, 1, cancel).await })
            .await?;
        let Some(page) = page else {
            return Ok(None);
        };
        self.store.set_pages(key.clone(), vec![page]);
        Ok(self.store.get(key))
    }

    /// Fetch and append the page after the last loaded one. `Ok(None)` if
    /// there is nothing more to load or the fetch was superseded.
    pub async fn fetch_next(&self, key: &CacheKey) -> Result<Option<CachedCollection>, SyncError> {
        let Some(next) = self.store.get(key).and_then(|c| c.next_page_param()) else {
            return Ok(None);
        };
        let source = Arc::clone(&self.source);
        let page = self
            .exclusive(key, |cancel| async move {
                source.fetch_page(key, next, cancel).await
            })
            .await?;
        let Some(page) = page else {
            return Ok(None);
        };
        self.store.append_page(key.clone(), page);
        Ok(self.store.get(key))
    }

    /// Re-fetch every loaded page of `key` and replace the collection.
    pub async fn refetch(&self, key: &CacheKey) -> Result<Option<CachedCollection>, SyncError> {
        let params = match self.store.get(key) {
            Some(c) if key.is_paged() && !c.page_params.is_empty() => c.page_params,
            _ => vec![1],
        };
        let source = Arc::clone(&self.source);
        let pages = self
            .exclusive(key, |cancel| async move {
                let mut pages = Vec::with_capacity(params.len());
                for page in params {
                    pages.push(source.fetch_page(key, page, cancel.clone()).await?);
                }
                Ok(pages)
            })
            .await?;
        let Some(pages) = pages else {
            return Ok(None);
        };
        debug!(key = %key, pages = pages.len(), "refetched");
        self.store.set_pages(key.clone(), pages);
        Ok(self.store.get(key))
    }

    /// Mark `key` active for the lifetime of the returned handle, fetching
    /// it first if the cached data is missing or stale.
    pub async fn watch(&self, key: CacheKey) -> Result<ViewHandle, SyncError> {
        let guard = self.store.observe(key);
        if guard.needs_fetch() {
            self.refetch(guard.key()).await?;
        }
        let events = self.store.subscribe();
        Ok(ViewHandle { guard, events })
    }

    /// Serve `RefetchRequested` events until `shutdown` flips to true.
    ///
    /// Each refetch runs on its own task so a newer request for the same key
    /// supersedes an older one instead of queueing behind it.
    pub async fn run_refetch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.store.subscribe();
        info!("refetch loop started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(CacheEvent::RefetchRequested { key }) => {
                        let client = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = client.refetch(&key).await {
                                warn!(key = %key, error = %e, "scheduled refetch failed");
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "refetch loop lagged, refetching active keys");
                        for key in self.store.keys() {
                            if self.store.is_active(&key) && self.store.is_stale(&key) {
                                let client = Arc::clone(&self);
                                tokio::spawn(async move {
                                    if let Err(e) = client.refetch(&key).await {
                                        warn!(key = %key, error = %e, "scheduled refetch failed");
                                    }
                                });
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        info!("refetch loop stopped");
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
