//! Collection-level patch primitives.
//!
//! Each primitive takes the current collection and returns the patched copy,
//! or `None` when the patch would not change anything. Every primitive keeps
//! ids unique within a page and is a no-op when applied a second time, which
//! is what makes realtime replays idempotent.

use serde_json::{Map, Value};

use crate::cache::CachedCollection;
use crate::types::{EntityId, Record};

/// A single keyed patch, shared by optimistic mutations and the realtime
/// reconciler.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    /// Insert at the head of the first page, or merge if already present.
    Prepend(Record),
    /// Merge fields into the entity with `id`.
    Merge {
        id: EntityId,
        fields: Map<String, Value>,
    },
    /// Remove the entity with this id from every page.
    Remove(EntityId),
    /// Swap the entity with `id` for `record` (e.g. placeholder for the
    /// server-confirmed row).
    Replace { id: EntityId, record: Record },
    /// Add `delta` to a numeric field, clamping at `floor`.
    ///
    /// This is a bounded-trust estimate. `confirmed_field` names the field of
    /// the confirmed payload that carries the authoritative value; on commit
    /// that value overwrites the estimate.
    Adjust {
        id: EntityId,
        field: String,
        delta: f64,
        floor: Option<f64>,
        confirmed_field: Option<String>,
    },
}

impl PatchOp {
    /// Apply to a collection. `None` means unchanged.
    pub fn apply(&self, collection: &CachedCollection) -> Option<CachedCollection> {
        match self {
            PatchOp::Prepend(record) => prepend(collection, record),
            PatchOp::Merge { id, fields } => merge_by_id(collection, *id, fields),
            PatchOp::Remove(id) => remove_by_id(collection, *id),
            PatchOp::Replace { id, record } => replace_by_id(collection, *id, record),
            PatchOp::Adjust {
                id,
                field,
                delta,
                floor,
                ..
            } => adjust_number(collection, *id, field, *delta, *floor),
        }
    }

    /// The patch that overwrites this op's guess with authoritative values
    /// from `confirmed`, if any.
    pub fn commit_with(&self, confirmed: &Record) -> Option<PatchOp> {
        match self {
            PatchOp::Prepend(placeholder) => Some(PatchOp::Replace {
                id: placeholder.id()?,
                record: confirmed.clone(),
            }),
            PatchOp::Replace { id, .. } => Some(PatchOp::Replace {
                id: *id,
                record: confirmed.clone(),
            }),
            PatchOp::Merge { id, .. } => (confirmed.id() == Some(*id)).then(|| PatchOp::Merge {
                id: *id,
                fields: confirmed.fields().clone(),
            }),
            PatchOp::Adjust {
                id,
                field,
                confirmed_field,
                ..
            } => {
                let value = match confirmed_field {
                    Some(source) => confirmed.get(source)?,
                    None if confirmed.id() == Some(*id) => confirmed.get(field)?,
                    None => return None,
                };
                if value.is_null() {
                    return None;
                }
                let mut fields = Map::new();
                fields.insert(field.clone(), value.clone());
                Some(PatchOp::Merge { id: *id, fields })
            }
            PatchOp::Remove(_) => None,
        }
    }

    /// Entity id this op is keyed by.
    pub fn target_id(&self) -> Option<EntityId> {
        match self {
            PatchOp::Prepend(record) => record.id(),
            PatchOp::Merge { id, .. }
            | PatchOp::Remove(id)
            | PatchOp::Replace { id, .. }
            | PatchOp::Adjust { id, .. } => Some(*id),
        }
    }
}

fn position(collection: &CachedCollection, id: EntityId) -> Option<(usize, usize)> {
    collection.pages.iter().enumerate().find_map(|(p, page)| {
        page.items
            .iter()
            .position(|r| r.id() == Some(id))
            .map(|i| (p, i))
    })
}

fn recompute_pages(page: &mut crate::types::Page, total: u64) {
    page.total = Some(total);
    if page.page_size > 0 && page.total_pages.is_some() {
        page.total_pages = Some(total.div_ceil(page.page_size as u64) as u32);
    }
}

/// Insert `record` at the head of the first page and truncate the page back
/// to its page size. If the id is already cached anywhere the fields are
/// merged instead.
pub fn prepend(collection: &CachedCollection, record: &Record) -> Option<CachedCollection> {
    let id = record.id()?;
    if position(collection, id).is_some() {
        return merge_by_id(collection, id, record.fields());
    }
    let mut next = collection.clone();
    let first = next.pages.first_mut()?;
    first.items.insert(0, record.clone());
    if first.page_size > 0 {
        first.items.truncate(first.page_size as usize);
    }
    if let Some(total) = first.total {
        recompute_pages(first, total + 1);
    }
    Some(next)
}

/// Merge `fields` into the entity with `id`. Unknown ids are a no-op.
pub fn merge_by_id(
    collection: &CachedCollection,
    id: EntityId,
    fields: &Map<String, Value>,
) -> Option<CachedCollection> {
    let (p, i) = position(collection, id)?;
    let mut next = collection.clone();
    let mut fields = fields.clone();
    // the id itself is never rewritten by a merge
    fields.remove("id");
    let changed = next.pages[p].items[i].merge(&fields);
    changed.then_some(next)
}

/// Remove the entity with `id` from every page. Later pages are left alone
/// even if an earlier page shrinks.
pub fn remove_by_id(collection: &CachedCollection, id: EntityId) -> Option<CachedCollection> {
    let mut next = collection.clone();
    let mut removed = false;
    for page in &mut next.pages {
        let before = page.items.len();
        page.items.retain(|r| r.id() != Some(id));
        removed |= page.items.len() != before;
    }
    if !removed {
        return None;
    }
    if let Some(first) = next.pages.first_mut()
        && let Some(total) = first.total
    {
        recompute_pages(first, total.saturating_sub(1));
    }
    Some(next)
}

/// Replace the entity with `id` by `record`.
///
/// If `record` carries a different id that is already cached (the confirmed
/// row arrived through another path first), the old row is removed instead,
/// keeping ids unique. Both rows were counted in the total, so it drops by
/// one.
pub fn replace_by_id(
    collection: &CachedCollection,
    id: EntityId,
    record: &Record,
) -> Option<CachedCollection> {
    let new_id = record.id()?;
    let (p, i) = position(collection, id)?;
    if new_id != id && position(collection, new_id).is_some() {
        let mut next = collection.clone();
        next.pages[p].items.remove(i);
        if let Some(first) = next.pages.first_mut()
            && let Some(total) = first.total
        {
            recompute_pages(first, total.saturating_sub(1));
        }
        return Some(next);
    }
    if collection.pages[p].items[i] == *record {
        return None;
    }
    let mut next = collection.clone();
    next.pages[p].items[i] = record.clone();
    Some(next)
}

/// Add `delta` to a numeric field, clamping the result at `floor`.
pub fn adjust_number(
    collection: &CachedCollection,
    id: EntityId,
    field: &str,
    delta: f64,
    floor: Option<f64>,
) -> Option<CachedCollection> {
    let (p, i) = position(collection, id)?;
    let current = collection.pages[p].items[i].number(field)?;
    let mut value = current + delta;
    if let Some(floor) = floor {
        value = value.max(floor);
    }
    if value == current {
        return None;
    }
    let mut next = collection.clone();
    next.pages[p].items[i].set(field, value);
    Some(next)
}
