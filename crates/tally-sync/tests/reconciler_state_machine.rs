//! Stateful property testing for realtime reconciliation.
//!
//! Uses proptest-state-machine to drive a reconciler with arbitrary
//! created / updated / deleted events and redeliveries. The model tracks:
//!
//! - The ordered ids of the first page (newest first, bounded by page size)
//! - The server-reported total
//! - The last known balance per id

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::json;

use tally_sync::{
    Action, CacheKey, CacheStore, EntityTag, FilterDescriptor, InvalidationRouter, Page,
    PushMessage, RealtimeReconciler, Record, ViewGuard,
};

const PAGE_SIZE: usize = 8;
const SEEDED_TOTAL: u64 = 20;

fn sales_key() -> CacheKey {
    CacheKey::list(EntityTag::Sales, FilterDescriptor::new())
}

/// Events the push channel can deliver.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    Created { id: i64, balance: i64 },
    Updated { id: i64, balance: i64 },
    Deleted { id: i64 },
    /// Deliver the previous event again.
    Redeliver,
}

/// Reference model of the cached first page.
#[derive(Clone, Debug)]
pub struct FirstPageModel {
    pub ids: Vec<i64>,
    pub total: u64,
    pub balances: HashMap<i64, i64>,
    pub next_id: i64,
    pub last: Option<RealtimeEvent>,
}

impl Default for FirstPageModel {
    fn default() -> Self {
        let ids: Vec<i64> = (13..=20).rev().collect();
        let balances = ids.iter().map(|id| (*id, 100)).collect();
        Self {
            ids,
            total: SEEDED_TOTAL,
            balances,
            next_id: 21,
            last: None,
        }
    }
}

impl ReferenceStateMachine for FirstPageModel {
    type State = Self;
    type Transition = RealtimeEvent;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let next_id = state.next_id;
        prop_oneof![
            3 => (0i64..500).prop_map(move |balance| RealtimeEvent::Created { id: next_id, balance }),
            2 => (1..next_id, 0i64..500).prop_map(|(id, balance)| RealtimeEvent::Updated { id, balance }),
            2 => (1..next_id).prop_map(|id| RealtimeEvent::Deleted { id }),
            1 => Just(RealtimeEvent::Redeliver),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            RealtimeEvent::Created { id, balance } => {
                state.ids.insert(0, *id);
                state.ids.truncate(PAGE_SIZE);
                state.total += 1;
                state.balances.insert(*id, *balance);
                state.next_id += 1;
            }
            RealtimeEvent::Updated { id, balance } => {
                if state.ids.contains(id) {
                    state.balances.insert(*id, *balance);
                }
            }
            RealtimeEvent::Deleted { id } => {
                if let Some(pos) = state.ids.iter().position(|i| i == id) {
                    state.ids.remove(pos);
                    state.total -= 1;
                }
            }
            RealtimeEvent::Redeliver => return state,
        }
        state.last = Some(transition.clone());
        state
    }

    fn preconditions(state: &Self::State, transition: &Self::Transition) -> bool {
        match transition {
            RealtimeEvent::Created { id, .. } => *id == state.next_id,
            RealtimeEvent::Updated { id, .. } | RealtimeEvent::Deleted { id } => *id < state.next_id,
            RealtimeEvent::Redeliver => true,
        }
    }
}

/// Test harness wrapping a real store and reconciler.
pub struct ReconcilerHarness {
    store: Arc<CacheStore>,
    reconciler: RealtimeReconciler,
    _view: ViewGuard,
    last: Option<PushMessage>,
    version: u64,
}

impl ReconcilerHarness {
    fn new() -> Self {
        let store = CacheStore::new();
        let items = (13..=20)
            .rev()
            .map(|id| {
                let mut r = Record::new(id);
                r.set("remaining_balance", 100);
                r
            })
            .collect();
        store.set_pages(
            sales_key(),
            vec![Page::new(1, PAGE_SIZE as u32, items).with_total(SEEDED_TOTAL)],
        );
        let view = store.observe(sales_key());
        let reconciler =
            RealtimeReconciler::new(Arc::clone(&store), Arc::new(InvalidationRouter::dashboard()));
        Self {
            store,
            reconciler,
            _view: view,
            last: None,
            version: 0,
        }
    }

    /// Updates carry a version so that a legitimate repeat of an earlier
    /// update is not mistaken for a redelivery.
    fn message(event: &RealtimeEvent, version: u64) -> Option<PushMessage> {
        let (action, payload) = match event {
            RealtimeEvent::Created { id, balance } => (
                Action::Created,
                json!({ "id": id, "customer": format!("c{id}"), "remaining_balance": balance }),
            ),
            RealtimeEvent::Updated { id, balance } => (
                Action::Updated,
                json!({ "id": id, "remaining_balance": balance, "version": version }),
            ),
            RealtimeEvent::Deleted { id } => (Action::Deleted, json!({ "id": id })),
            RealtimeEvent::Redeliver => return None,
        };
        Some(PushMessage {
            resource: "sale".to_string(),
            action,
            payload: serde_json::from_value(payload).unwrap(),
        })
    }

    fn deliver(&mut self, event: &RealtimeEvent) {
        self.version += 1;
        let message = match Self::message(event, self.version) {
            Some(message) => message,
            None => match self.last.clone() {
                Some(message) => message,
                None => return,
            },
        };
        self.reconciler.handle(&message);
        self.last = Some(message);
    }

    fn verify_invariants(&self, model: &FirstPageModel) {
        let collection = self.store.get(&sales_key()).expect("sales list cached");

        // Invariant 1: ids and order match the model
        assert_eq!(collection.ids(), model.ids);

        // Invariant 2: total tracks creates and deletes
        assert_eq!(collection.total(), Some(model.total));

        // Invariant 3: no id appears twice
        assert!(collection.pages_unique());

        // Invariant 4: every cached row carries the latest balance
        for record in collection.items() {
            let id = record.id().unwrap();
            assert_eq!(
                record.integer("remaining_balance"),
                model.balances.get(&id).copied(),
                "balance mismatch for id {id}"
            );
        }
    }
}

impl StateMachineTest for ReconcilerHarness {
    type SystemUnderTest = Self;
    type Reference = FirstPageModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.deliver(&transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn reconciler_state_machine_test(sequential 1..50 => ReconcilerHarness);
}

#[test]
fn test_redelivered_create_does_not_grow_total() {
    let mut harness = ReconcilerHarness::new();
    let created = RealtimeEvent::Created { id: 21, balance: 5 };
    harness.deliver(&created);
    harness.deliver(&RealtimeEvent::Redeliver);
    harness.deliver(&RealtimeEvent::Redeliver);

    let collection = harness.store.get(&sales_key()).unwrap();
    assert_eq!(collection.total(), Some(SEEDED_TOTAL + 1));
    assert_eq!(collection.ids().first(), Some(&21));
    assert_eq!(collection.ids().len(), PAGE_SIZE);
}

#[test]
fn test_deleting_evicted_row_is_noop() {
    let mut harness = ReconcilerHarness::new();
    // id 13 falls off the page after one create
    harness.deliver(&RealtimeEvent::Created { id: 21, balance: 5 });
    harness.deliver(&RealtimeEvent::Deleted { id: 13 });

    let collection = harness.store.get(&sales_key()).unwrap();
    assert_eq!(collection.total(), Some(SEEDED_TOTAL + 1));
    assert!(!collection.contains(13));
}
