//! End-to-end behaviour of the cache, pipeline, router and push channel
//! working together.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tally_sync::channel::FrameStream;
use tally_sync::{
    CacheKey, CacheStore, ChannelState, Connector, DEFAULT_RECONNECT_DELAY, DashboardClient,
    EntityTag, FilterDescriptor, InvalidationRouter, MutationPipeline, Page, Parent, PaymentInput,
    PushChannel, RealtimeReconciler, Record, Session, SyncError, plans,
};

type FrameTx = mpsc::UnboundedSender<Result<String, SyncError>>;

/// Connector whose connections are fed by the test.
#[derive(Default)]
struct ScriptedConnector {
    connections: Mutex<Vec<FrameTx>>,
}

impl ScriptedConnector {
    fn latest(&self) -> FrameTx {
        self.connections.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _url: &str) -> Result<FrameStream, SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.lock().unwrap().push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn sales_key() -> CacheKey {
    CacheKey::list(EntityTag::Sales, FilterDescriptor::new().search("").page_size(8))
}

fn sale(id: i64) -> Record {
    let mut r = Record::new(id);
    r.set("customer", format!("customer {id}"));
    r
}

fn seeded_sales(store: &CacheStore) {
    let items = (1..=8).rev().map(sale).collect();
    store.set_pages(sales_key(), vec![Page::new(1, 8, items).with_total(8)]);
}

fn realtime(store: &Arc<CacheStore>) -> (Arc<ScriptedConnector>, Arc<PushChannel>, Arc<RealtimeReconciler>) {
    let connector = Arc::new(ScriptedConnector::default());
    let channel =
        PushChannel::with_connector("ws://test/ws/events/", DEFAULT_RECONNECT_DELAY, connector.clone());
    let reconciler = Arc::new(RealtimeReconciler::new(
        Arc::clone(store),
        Arc::new(InvalidationRouter::dashboard()),
    ));
    (connector, channel, reconciler)
}

#[tokio::test]
async fn test_pushed_sale_rotates_first_page() {
    let store = CacheStore::new();
    seeded_sales(&store);
    let _view = store.observe(sales_key());
    let (connector, channel, reconciler) = realtime(&store);
    let _sub = reconciler.attach(&channel);
    settle().await;

    connector
        .latest()
        .send(Ok(json!({
            "resource": "sale",
            "action": "created",
            "payload": { "id": 9, "customer": "walk-in" }
        })
        .to_string()))
        .unwrap();
    settle().await;

    let collection = store.get(&sales_key()).unwrap();
    assert_eq!(collection.ids(), vec![9, 8, 7, 6, 5, 4, 3, 2]);
    assert!(!collection.contains(1));
    assert_eq!(collection.total(), Some(9));
    channel.stop().await;
}

fn purchase_store() -> (Arc<CacheStore>, CacheKey, CacheKey) {
    let store = CacheStore::new();
    let mut purchase = Record::new(7);
    purchase.set("balance", 500);
    purchase.set("status", "partial");
    let detail = CacheKey::detail(EntityTag::Purchases, 7);
    let list = CacheKey::list(EntityTag::Purchases, FilterDescriptor::new());
    store.set_pages(detail.clone(), vec![Page::new(1, 1, vec![purchase.clone()]).with_total(1)]);
    store.set_pages(list.clone(), vec![Page::new(1, 8, vec![purchase]).with_total(1)]);
    (store, detail, list)
}

async fn logged_in(server: &MockServer) -> DashboardClient {
    let client = DashboardClient::new(server.uri());
    client
        .set_session(Session {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            username: Some("clerk".to_string()),
        })
        .await;
    client
}

fn payment_input() -> PaymentInput {
    PaymentInput {
        amount: 200.0,
        bank_id: Some(2),
        method: Some("cash".to_string()),
        date: None,
    }
}

fn balance(store: &CacheStore, key: &CacheKey) -> Option<f64> {
    store.get(key)?.find(7)?.number("balance")
}

#[tokio::test]
async fn test_purchase_payment_commits_without_visible_change() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/purchases/7/payments/"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 31,
            "purchase_id": 7,
            "bank_id": 2,
            "amount": 200.0,
            "method": "cash",
            "balance_after": 300.0
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = logged_in(&server).await;
    let (store, detail, list) = purchase_store();
    let pipeline = MutationPipeline::new(Arc::clone(&store), Arc::new(InvalidationRouter::dashboard()));
    let input = payment_input();

    let observed = Arc::clone(&store);
    let watched = detail.clone();
    let outcome = pipeline
        .execute(plans::pay_purchase(7, &input), async {
            // optimistic state while the write is in flight
            assert_eq!(balance(&observed, &watched), Some(300.0));
            client.pay_purchase(7, &input).await
        })
        .await
        .unwrap();

    assert_eq!(outcome.value.balance_after, Some(300.0));
    for key in [&detail, &list] {
        assert_eq!(balance(&store, key), Some(300.0));
        let row = store.get(key).unwrap().find(7).cloned().unwrap();
        assert_eq!(row.get("status"), Some(&json!("partial")));
    }
    // the confirmed balance is already in place, so the row is not refetched
    assert!(!outcome.invalidation.invalidated.contains(&detail));
    assert!(!store.is_stale(&detail));
    assert!(outcome.invalidation.invalidated.contains(&list));
}

#[tokio::test]
async fn test_rejected_purchase_payment_rolls_back() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/purchases/7/payments/"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"detail": "bank account closed"})),
        )
        .mount(&server)
        .await;

    let client = logged_in(&server).await;
    let (store, detail, list) = purchase_store();
    let before = store.export();
    let pipeline = MutationPipeline::new(Arc::clone(&store), Arc::new(InvalidationRouter::dashboard()));
    let input = payment_input();

    let result = pipeline
        .execute(plans::pay_purchase(7, &input), client.pay_purchase(7, &input))
        .await;

    assert!(matches!(result, Err(SyncError::Api { status: 400, .. })));
    assert_eq!(balance(&store, &detail), Some(500.0));
    assert_eq!(balance(&store, &list), Some(500.0));
    assert_eq!(store.export(), before);
}

#[tokio::test(start_paused = true)]
async fn test_channel_recovers_and_keeps_reconciling() {
    let store = CacheStore::new();
    seeded_sales(&store);
    let _view = store.observe(sales_key());
    let (connector, channel, reconciler) = realtime(&store);
    let _sub = reconciler.attach(&channel);
    settle().await;
    assert_eq!(channel.state(), ChannelState::Open);

    connector
        .latest()
        .send(Err(SyncError::WebSocket("connection reset".into())))
        .unwrap();
    settle().await;
    assert_eq!(channel.state(), ChannelState::Disconnected);
    assert_eq!(channel.connect_attempts(), 1);

    tokio::time::sleep(DEFAULT_RECONNECT_DELAY + Duration::from_millis(50)).await;
    settle().await;
    assert_eq!(channel.connect_attempts(), 2);
    assert_eq!(channel.state(), ChannelState::Open);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(channel.connect_attempts(), 2);

    connector
        .latest()
        .send(Ok(json!({
            "resource": "sales",
            "action": "deleted",
            "payload": { "id": 4 }
        })
        .to_string()))
        .unwrap();
    settle().await;
    assert!(!store.get(&sales_key()).unwrap().contains(4));
    channel.stop().await;
}

#[tokio::test]
async fn test_overlapping_deletes_keep_committed_removal() {
    let store = CacheStore::new();
    seeded_sales(&store);
    let pipeline = MutationPipeline::new(Arc::clone(&store), Arc::new(InvalidationRouter::dashboard()));

    let (first_tx, first_rx) = oneshot::channel::<Result<Value, SyncError>>();
    let (second_tx, second_rx) = oneshot::channel::<Result<Value, SyncError>>();

    let first = pipeline.execute(plans::delete(EntityTag::Sales, 5), async {
        first_rx.await.unwrap()
    });
    let second = pipeline.execute(plans::delete(EntityTag::Sales, 5), async {
        second_rx.await.unwrap()
    });
    let server = async {
        settle().await;
        first_tx.send(Ok(Value::Null)).unwrap();
        settle().await;
        second_tx
            .send(Err(SyncError::Api {
                status: 404,
                message: "sale not found".into(),
            }))
            .unwrap();
    };

    let (first, second, ()) = tokio::join!(first, second, server);
    assert!(first.is_ok());
    assert!(second.is_err());

    let collection = store.get(&sales_key()).unwrap();
    assert!(!collection.contains(5));
    assert_eq!(collection.ids(), vec![8, 7, 6, 4, 3, 2, 1]);
}

#[test]
fn test_sale_delete_invalidates_exactly_routed_keys() {
    let store = CacheStore::new();
    let empty = FilterDescriptor::new;
    let keys = [
        sales_key(),
        CacheKey::detail(EntityTag::Sales, 5),
        CacheKey::linked(EntityTag::Transactions, Parent::sale(5), empty()),
        CacheKey::linked(EntityTag::Transactions, Parent::sale(6), empty()),
        CacheKey::linked(EntityTag::Payments, Parent::sale(5), empty()),
        CacheKey::list(EntityTag::Products, empty()),
        CacheKey::list(EntityTag::AllProducts, empty()),
        CacheKey::list(EntityTag::Profit, empty()),
        CacheKey::list(EntityTag::Purchases, empty()),
        CacheKey::list(EntityTag::Banks, empty()),
    ];
    for key in &keys {
        store.set_pages(key.clone(), vec![Page::new(1, 8, Vec::new()).with_total(0)]);
    }

    let report = InvalidationRouter::dashboard().apply(
        &store,
        EntityTag::Sales,
        tally_sync::Action::Deleted,
        &Record::new(5),
    );

    let mut invalidated = report.invalidated.clone();
    invalidated.sort();
    let mut expected = vec![
        sales_key(),
        CacheKey::detail(EntityTag::Sales, 5),
        CacheKey::linked(EntityTag::Transactions, Parent::sale(5), empty()),
        CacheKey::list(EntityTag::Products, empty()),
        CacheKey::list(EntityTag::AllProducts, empty()),
        CacheKey::list(EntityTag::Profit, empty()),
    ];
    expected.sort();
    assert_eq!(invalidated, expected);

    for key in &keys {
        assert_eq!(store.is_stale(key), expected.contains(key), "{key}");
    }
}
