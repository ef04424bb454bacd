//! Ready-made [`MutationPlan`]s for the dashboard's writes.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{Map, Value};

use crate::key::{KeyPredicate, Parent};
use crate::mutation::MutationPlan;
use crate::patch::PatchOp;
use crate::types::{Action, BALANCE_AFTER, EntityId, EntityTag, PaymentInput, Record};

static NEXT_PLACEHOLDER_ID: AtomicI64 = AtomicI64::new(-1);

/// A fresh negative id for an optimistic row. Never collides with a server
/// id.
pub fn placeholder_id() -> EntityId {
    NEXT_PLACEHOLDER_ID.fetch_sub(1, Ordering::Relaxed)
}

/// Create an entity. `draft` is shown at the head of visible lists (and of
/// its parents' sub-collections) until the server answers; the confirmed
/// row then replaces it.
pub fn create(tag: EntityTag, mut draft: Record) -> MutationPlan {
    if draft.id().is_none() {
        draft.set("id", placeholder_id());
    }
    let mut targets = vec![KeyPredicate::Lists(tag)];
    targets.extend(
        Parent::from_payload(&draft)
            .into_iter()
            .map(|parent| KeyPredicate::LinkedTo { tag, parent }),
    );
    MutationPlan::new(tag, Action::Created, draft.clone())
        .patch_active(KeyPredicate::AnyOf(targets), PatchOp::Prepend(draft))
}

/// Merge `fields` into every cached copy of the entity.
pub fn update(tag: EntityTag, id: EntityId, fields: Map<String, Value>) -> MutationPlan {
    let mut subject = Record::from_map(fields.clone());
    subject.set("id", id);
    MutationPlan::new(tag, Action::Updated, subject)
        .patch(KeyPredicate::Family(tag), PatchOp::Merge { id, fields })
}

/// Remove the entity from every cached collection.
pub fn delete(tag: EntityTag, id: EntityId) -> MutationPlan {
    MutationPlan::new(tag, Action::Deleted, Record::new(id))
        .patch(KeyPredicate::Family(tag), PatchOp::Remove(id))
}

/// Pay towards a purchase. The purchase's `balance` drops by the amount,
/// floored at zero, until the server's recalculated balance arrives.
pub fn pay_purchase(purchase_id: EntityId, input: &PaymentInput) -> MutationPlan {
    payment(EntityTag::Purchases, "purchase_id", purchase_id, input)
}

/// Pay towards a sale. Adjusts `remaining_balance` like [`pay_purchase`].
pub fn pay_sale(sale_id: EntityId, input: &PaymentInput) -> MutationPlan {
    payment(EntityTag::Sales, "sale_id", sale_id, input)
}

fn payment(
    parent: EntityTag,
    link_field: &str,
    parent_id: EntityId,
    input: &PaymentInput,
) -> MutationPlan {
    let balance_field = parent.balance_field().unwrap_or("balance");
    let mut subject = Record::from_map(Map::new());
    subject.set(link_field, parent_id);
    subject.set("amount", input.amount);
    if let Some(bank_id) = input.bank_id {
        subject.set("bank_id", bank_id);
    }

    MutationPlan::new(EntityTag::Payments, Action::Created, subject).patch(
        KeyPredicate::Family(parent),
        PatchOp::Adjust {
            id: parent_id,
            field: balance_field.to_string(),
            delta: -input.amount,
            floor: Some(0.0),
            confirmed_field: Some(BALANCE_AFTER.to_string()),
        },
    )
}
