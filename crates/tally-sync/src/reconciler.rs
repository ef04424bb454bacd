//! Turns push-channel events into the same cache effects a local mutation
//! would have produced.
//!
//! | action    | patch                                              | scope  |
//! |-----------|----------------------------------------------------|--------|
//! | `created` | prepend into lists and linked sub-collections      | active |
//! | `updated` | merge fields into every cached copy                | all    |
//! | `deleted` | remove from every cached copy                      | all    |
//!
//! Payment events that carry `balance_after` also write it into the parent
//! sale or purchase wherever that row is cached.
//!
//! After the patch the router's entries for `(entity, action)` run, so a
//! client that only ever sees events still converges on counts and derived
//! fields. All patches are keyed by entity id, so an event delivered twice in
//! a row changes nothing the second time.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::cache::{CacheStore, Scope};
use crate::channel::{PushChannel, PushMessage, Subscription};
use crate::invalidation::{InvalidationReport, InvalidationRouter};
use crate::key::{CacheKey, KeyPredicate, Parent};
use crate::patch::PatchOp;
use crate::types::{Action, BALANCE_AFTER, EntityTag, Record};

/// Default number of recent event fingerprints remembered.
pub const DEFAULT_DEDUP_WINDOW: usize = 256;

/// Fields a pushed row must carry before it can be shown in place.
///
/// List views render these directly; rows without them are left for the
/// refetch that the invalidation step schedules.
fn display_fields(tag: EntityTag) -> &'static [&'static str] {
    match tag {
        EntityTag::Transactions => &["bank_name", "type_display"],
        EntityTag::Payments => &["method", "date"],
        _ => &[],
    }
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled {
    /// The resource name is not a known entity family.
    Unknown(String),
    /// Identical to an event seen within the dedup window.
    Duplicate,
    Applied {
        /// Collections whose contents changed.
        patched: Vec<CacheKey>,
        /// True if the payload could not be patched in place.
        patch_skipped: bool,
        invalidation: InvalidationReport,
    },
}

/// Bounded set of recent fingerprints, oldest evicted first.
#[derive(Debug, Default)]
struct DedupWindow {
    capacity: usize,
    order: VecDeque<u64>,
    seen: HashSet<u64>,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Record `fingerprint`. Returns false if it is already in the window.
    fn insert(&mut self, fingerprint: u64) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if !self.seen.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        true
    }
}

fn fingerprint(message: &PushMessage) -> u64 {
    let mut hasher = DefaultHasher::new();
    message.resource.hash(&mut hasher);
    message.action.hash(&mut hasher);
    // serde_json maps are ordered, so equal payloads serialize equally
    serde_json::to_string(&message.payload)
        .unwrap_or_default()
        .hash(&mut hasher);
    hasher.finish()
}

/// Applies realtime events to a [`CacheStore`].
pub struct RealtimeReconciler {
    store: Arc<CacheStore>,
    router: Arc<InvalidationRouter>,
    recent: Mutex<DedupWindow>,
}

impl RealtimeReconciler {
    pub fn new(store: Arc<CacheStore>, router: Arc<InvalidationRouter>) -> Self {
        Self::with_dedup_window(store, router, DEFAULT_DEDUP_WINDOW)
    }

    /// `window == 0` disables duplicate-frame detection.
    pub fn with_dedup_window(
        store: Arc<CacheStore>,
        router: Arc<InvalidationRouter>,
        window: usize,
    ) -> Self {
        Self {
            store,
            router,
            recent: Mutex::new(DedupWindow::new(window)),
        }
    }

    /// Subscribe to `channel`. Events are applied until the returned
    /// subscription is dropped.
    pub fn attach(self: &Arc<Self>, channel: &Arc<PushChannel>) -> Subscription {
        let reconciler = Arc::clone(self);
        channel.subscribe(move |message| {
            reconciler.handle(message);
        })
    }

    /// Apply one event.
    pub fn handle(&self, message: &PushMessage) -> Reconciled {
        let Some(tag) = EntityTag::from_resource(&message.resource) else {
            warn!(resource = %message.resource, "ignoring event for unknown resource");
            return Reconciled::Unknown(message.resource.clone());
        };

        let fresh = self
            .recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(fingerprint(message));
        if !fresh {
            trace!(tag = %tag, action = %message.action, "duplicate event dropped");
            return Reconciled::Duplicate;
        }

        let payload = &message.payload;
        let mut patched = match self.patch(tag, message.action, payload) {
            Some(keys) => keys,
            None => {
                debug!(
                    tag = %tag,
                    action = %message.action,
                    id = ?payload.id(),
                    "event not patchable in place, relying on refetch"
                );
                Vec::new()
            }
        };
        let patch_skipped = patched.is_empty() && !self.patchable(tag, message.action, payload);
        if tag == EntityTag::Payments {
            for key in self.settle_parents(payload) {
                if !patched.contains(&key) {
                    patched.push(key);
                }
            }
        }

        let invalidation = self.router.apply(&self.store, tag, message.action, payload);
        debug!(
            tag = %tag,
            action = %message.action,
            id = ?payload.id(),
            patched = patched.len(),
            invalidated = invalidation.invalidated.len(),
            "realtime event reconciled"
        );

        Reconciled::Applied {
            patched,
            patch_skipped,
            invalidation,
        }
    }

    fn patchable(&self, tag: EntityTag, action: Action, payload: &Record) -> bool {
        payload.id().is_some()
            && (action == Action::Deleted || payload.has_fields(display_fields(tag)))
    }

    /// Patch matching collections. `None` if the payload cannot be patched.
    fn patch(&self, tag: EntityTag, action: Action, payload: &Record) -> Option<Vec<CacheKey>> {
        if !self.patchable(tag, action, payload) {
            return None;
        }
        let id = payload.id()?;

        let (predicate, scope, op) = match action {
            Action::Created => {
                let mut targets = vec![KeyPredicate::Lists(tag)];
                targets.extend(
                    Parent::from_payload(payload)
                        .into_iter()
                        .map(|parent| KeyPredicate::LinkedTo { tag, parent }),
                );
                (
                    KeyPredicate::AnyOf(targets),
                    Scope::Active,
                    PatchOp::Prepend(payload.clone()),
                )
            }
            Action::Updated => (
                KeyPredicate::Family(tag),
                Scope::All,
                PatchOp::Merge {
                    id,
                    fields: payload.fields().clone(),
                },
            ),
            Action::Deleted => (KeyPredicate::Family(tag), Scope::All, PatchOp::Remove(id)),
        };

        let snapshots = self
            .store
            .patch_matching(&predicate, scope, |_, current| op.apply(current?));
        Some(snapshots.into_iter().map(|s| s.key).collect())
    }
}

impl RealtimeReconciler {
    /// Write a payment's `balance_after` into its parents' balance field.
    fn settle_parents(&self, payload: &Record) -> Vec<CacheKey> {
        let Some(balance) = payload.get(BALANCE_AFTER).filter(|v| !v.is_null()) else {
            return Vec::new();
        };
        let mut keys = Vec::new();
        for parent in Parent::from_payload(payload) {
            let Some(field) = parent.tag.balance_field() else {
                continue;
            };
            let mut fields = serde_json::Map::new();
            fields.insert(field.to_string(), balance.clone());
            let op = PatchOp::Merge {
                id: parent.id,
                fields,
            };
            let snapshots = self.store.patch_matching(
                &KeyPredicate::Family(parent.tag),
                Scope::All,
                |_, current| op.apply(current?),
            );
            trace!(parent = %parent.tag, id = parent.id, touched = snapshots.len(), "parent balance settled");
            keys.extend(snapshots.into_iter().map(|s| s.key));
        }
        keys
    }
}

impl std::fmt::Debug for RealtimeReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeReconciler").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedCollection;
    use crate::key::FilterDescriptor;
    use crate::types::Page;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// Connects and never yields a frame.
    struct IdleConnector;

    #[async_trait::async_trait]
    impl crate::channel::Connector for IdleConnector {
        async fn connect(&self, _url: &str) -> Result<crate::channel::FrameStream, crate::SyncError> {
            Ok(Box::pin(futures_util::stream::pending()))
        }
    }

    fn sale(id: i64) -> Record {
        let mut r = Record::new(id);
        r.set("customer", format!("customer {}", id));
        r.set("remaining_balance", 100.0);
        r
    }

    fn message(resource: &str, action: Action, payload: serde_json::Value) -> PushMessage {
        PushMessage {
            resource: resource.to_string(),
            action,
            payload: serde_json::from_value(payload).unwrap(),
        }
    }

    fn sales_key() -> CacheKey {
        CacheKey::list(
            EntityTag::Sales,
            FilterDescriptor::new().search("").page_size(8),
        )
    }

    fn reconciler(store: &Arc<CacheStore>, window: usize) -> RealtimeReconciler {
        RealtimeReconciler::with_dedup_window(
            Arc::clone(store),
            Arc::new(InvalidationRouter::dashboard()),
            window,
        )
    }

    fn seeded_sales(store: &Arc<CacheStore>) {
        let items = (1..=8).rev().map(sale).collect();
        store.set_pages(sales_key(), vec![Page::new(1, 8, items).with_total(20)]);
    }

    #[test]
    fn test_created_prepends_and_truncates_full_page() {
        let store = CacheStore::new();
        seeded_sales(&store);
        let _view = store.observe(sales_key());
        let reconciler = reconciler(&store, 0);

        let result = reconciler.handle(&message(
            "sale",
            Action::Created,
            json!({"id": 9, "customer": "new", "remaining_balance": 50.0}),
        ));

        let collection = store.get(&sales_key()).unwrap();
        let page = collection.first_page().unwrap();
        assert_eq!(page.items.len(), 8);
        assert_eq!(collection.ids(), vec![9, 8, 7, 6, 5, 4, 3, 2]);
        assert!(!collection.contains(1));
        assert_eq!(page.total, Some(21));
        match result {
            Reconciled::Applied { patched, .. } => assert_eq!(patched, vec![sales_key()]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_created_skips_inactive_collections() {
        let store = CacheStore::new();
        seeded_sales(&store);
        let reconciler = reconciler(&store, 0);

        reconciler.handle(&message("sales", Action::Created, json!({"id": 9})));

        assert_eq!(store.get(&sales_key()).unwrap().ids()[0], 8);
        // the router still marks background lists stale
        assert!(store.is_stale(&sales_key()));
    }

    #[test]
    fn test_replayed_events_are_idempotent_without_dedup() {
        let store = CacheStore::new();
        seeded_sales(&store);
        let _view = store.observe(sales_key());
        let reconciler = reconciler(&store, 0);

        let events = [
            message("sale", Action::Created, json!({"id": 9, "customer": "x"})),
            message("sale", Action::Updated, json!({"id": 5, "customer": "renamed"})),
            message("sale", Action::Deleted, json!({"id": 3})),
        ];
        for event in &events {
            reconciler.handle(event);
            reconciler.handle(event);
        }

        let collection = store.get(&sales_key()).unwrap();
        assert_eq!(collection.ids(), vec![9, 8, 7, 6, 5, 4, 2]);
        assert_eq!(collection.total(), Some(20));
        assert_eq!(
            collection.find(5).unwrap().get("customer"),
            Some(&json!("renamed"))
        );
        assert!(collection.pages_unique());
    }

    #[test]
    fn test_dedup_window_drops_identical_frames() {
        let store = CacheStore::new();
        seeded_sales(&store);
        let reconciler = reconciler(&store, 2);
        let created = message("sale", Action::Created, json!({"id": 9}));

        assert!(matches!(reconciler.handle(&created), Reconciled::Applied { .. }));
        assert_eq!(reconciler.handle(&created), Reconciled::Duplicate);

        reconciler.handle(&message("sale", Action::Deleted, json!({"id": 1})));
        reconciler.handle(&message("sale", Action::Deleted, json!({"id": 2})));
        // evicted from a window of two
        assert!(matches!(reconciler.handle(&created), Reconciled::Applied { .. }));
    }

    #[test]
    fn test_update_reaches_detail_and_linked_copies() {
        let store = CacheStore::new();
        let detail = CacheKey::detail(EntityTag::Payments, 4);
        let linked = CacheKey::linked(
            EntityTag::Payments,
            Parent::purchase(3),
            FilterDescriptor::new(),
        );
        let mut payment = Record::new(4);
        payment.set("amount", 10.0);
        store.set_pages(detail.clone(), vec![Page::new(1, 1, vec![payment.clone()])]);
        store.set_pages(linked.clone(), vec![Page::new(1, 8, vec![payment])]);
        let reconciler = reconciler(&store, 0);

        reconciler.handle(&message(
            "payment",
            Action::Updated,
            json!({"id": 4, "amount": 12.5, "purchase_id": 3, "method": "cash", "date": "2024-05-01"}),
        ));

        for key in [&detail, &linked] {
            let row = store.get(key).unwrap().find(4).cloned().unwrap();
            assert_eq!(row.number("amount"), Some(12.5));
        }
    }

    fn purchases_key() -> CacheKey {
        CacheKey::list(EntityTag::Purchases, FilterDescriptor::new().page_size(8))
    }

    fn seeded_purchase(store: &Arc<CacheStore>) {
        let mut purchase = Record::new(7);
        purchase.set("balance", 500.0);
        purchase.set("status", "partial");
        store.set_pages(purchases_key(), vec![Page::new(1, 8, vec![purchase.clone()])]);
        store.set_pages(
            CacheKey::detail(EntityTag::Purchases, 7),
            vec![Page::new(1, 1, vec![purchase])],
        );
    }

    #[test]
    fn test_pushed_payment_settles_parent_balance() {
        let store = CacheStore::new();
        seeded_purchase(&store);
        let _view = store.observe(purchases_key());
        let reconciler = reconciler(&store, 0);
        let detail = CacheKey::detail(EntityTag::Purchases, 7);

        let payment = message(
            "payment",
            Action::Created,
            json!({"id": 31, "purchase_id": 7, "method": "cash", "date": "2024-05-01", "balance_after": 300.0}),
        );
        let result = reconciler.handle(&payment);
        reconciler.handle(&payment);

        for key in [&purchases_key(), &detail] {
            let row = store.get(key).unwrap().find(7).cloned().unwrap();
            assert_eq!(row.number("balance"), Some(300.0));
        }
        // the row is current; the list still refreshes derived columns
        assert!(!store.is_stale(&detail));
        assert!(store.is_stale(&purchases_key()));
        match result {
            Reconciled::Applied { patched, .. } => {
                assert!(patched.contains(&purchases_key()));
                assert!(patched.contains(&detail));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pushed_payment_without_balance_marks_parent_stale() {
        let store = CacheStore::new();
        seeded_purchase(&store);
        let reconciler = reconciler(&store, 0);

        reconciler.handle(&message(
            "payments",
            Action::Created,
            json!({"id": 32, "purchase_id": 7, "amount": 50.0}),
        ));

        let row = store.get(&purchases_key()).unwrap().find(7).cloned().unwrap();
        assert_eq!(row.number("balance"), Some(500.0));
        assert!(store.is_stale(&purchases_key()));
        assert!(store.is_stale(&CacheKey::detail(EntityTag::Purchases, 7)));
    }

    #[test]
    fn test_update_of_unknown_id_is_noop() {
        let store = CacheStore::new();
        seeded_sales(&store);
        let before = store.get(&sales_key());
        let reconciler = reconciler(&store, 0);

        let result = reconciler.handle(&message("sale", Action::Updated, json!({"id": 99})));

        assert_eq!(store.get(&sales_key()), before);
        match result {
            Reconciled::Applied {
                patched,
                patch_skipped,
                ..
            } => {
                assert!(patched.is_empty());
                assert!(!patch_skipped);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delete_leaves_later_pages_untouched() {
        let store = CacheStore::new();
        let key = sales_key();
        store.set_pages(
            key.clone(),
            vec![
                Page::new(1, 2, vec![sale(4), sale(3)]).with_total(4),
                Page::new(2, 2, vec![sale(2), sale(1)]).with_total(4),
            ],
        );
        let reconciler = reconciler(&store, 0);

        reconciler.handle(&message("sale", Action::Deleted, json!({"id": 4})));
        reconciler.handle(&message("sale", Action::Deleted, json!({"id": 4})));

        let collection: CachedCollection = store.get(&key).unwrap();
        assert_eq!(collection.pages[0].items.len(), 1);
        assert_eq!(collection.pages[1].items.len(), 2);
        assert_eq!(collection.total(), Some(3));
    }

    #[test]
    fn test_transaction_without_display_fields_only_invalidates() {
        let store = CacheStore::new();
        let key = CacheKey::list(EntityTag::Transactions, FilterDescriptor::new().page_size(8));
        store.set_pages(key.clone(), vec![Page::new(1, 8, vec![Record::new(1)])]);
        let _view = store.observe(key.clone());
        let reconciler = reconciler(&store, 0);

        let result = reconciler.handle(&message(
            "transaction",
            Action::Created,
            json!({"id": 2, "bank_id": 1, "amount": 40.0}),
        ));

        assert_eq!(store.get(&key).unwrap().ids(), vec![1]);
        assert!(store.is_stale(&key));
        match result {
            Reconciled::Applied {
                patch_skipped,
                invalidation,
                ..
            } => {
                assert!(patch_skipped);
                assert!(invalidation.invalidated.contains(&key));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transaction_created_lands_in_bank_sub_collection() {
        let store = CacheStore::new();
        let linked = CacheKey::linked(
            EntityTag::Transactions,
            Parent::bank(1),
            FilterDescriptor::new(),
        );
        store.set_pages(linked.clone(), vec![Page::new(1, 8, vec![Record::new(1)])]);
        let _view = store.observe(linked.clone());
        let reconciler = reconciler(&store, 0);

        reconciler.handle(&message(
            "transactions",
            Action::Created,
            json!({"id": 2, "bank_id": 1, "bank_name": "Main", "type_display": "Deposit"}),
        ));

        assert_eq!(store.get(&linked).unwrap().ids(), vec![2, 1]);
    }

    #[test]
    fn test_unknown_resource_is_ignored() {
        let store = CacheStore::new();
        let reconciler = reconciler(&store, 0);
        assert_eq!(
            reconciler.handle(&message("widget", Action::Created, json!({"id": 1}))),
            Reconciled::Unknown("widget".to_string())
        );
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_attach_applies_dispatched_frames() {
        let store = CacheStore::new();
        seeded_sales(&store);
        let _view = store.observe(sales_key());
        let reconciler = Arc::new(reconciler(&store, 0));
        let channel = PushChannel::with_connector(
            "ws://test",
            std::time::Duration::from_secs(60),
            Arc::new(IdleConnector),
        );

        let subscription = reconciler.attach(&channel);
        channel.dispatch(r#"{"resource":"sale","action":"deleted","payload":{"id":8}}"#);
        assert!(!store.get(&sales_key()).unwrap().contains(8));

        drop(subscription);
        channel.dispatch(r#"{"resource":"sale","action":"deleted","payload":{"id":7}}"#);
        assert!(store.get(&sales_key()).unwrap().contains(7));
        channel.stop().await;
    }
}
