//! Cache keys and the predicates used to select them.
//!
//! A [`CacheKey`] names one filtered, paginated view. Bulk operations
//! (patches, invalidation) address keys through a [`KeyPredicate`], matched by
//! [`CacheKey::matches`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EntityTag, Record};

/// Parameter name for the page size inside a descriptor.
pub const PAGE_SIZE_PARAM: &str = "page_size";

/// Canonical, order-independent encoding of list query parameters.
///
/// Values are trimmed and empty values are dropped, so `q = ""` and an absent
/// `q` produce the same descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterDescriptor(BTreeMap<String, String>);

impl FilterDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or clear) a parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl AsRef<str>) {
        let name = name.into();
        let value = value.as_ref().trim();
        if value.is_empty() {
            self.0.remove(name.trim());
        } else {
            self.0.insert(name.trim().to_string(), value.to_string());
        }
    }

    #[must_use]
    pub fn search(self, q: impl AsRef<str>) -> Self {
        self.param("q", q)
    }

    #[must_use]
    pub fn status(self, status: impl AsRef<str>) -> Self {
        self.param("status", status)
    }

    #[must_use]
    pub fn date_range(self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        let from = from.map(|d| d.to_string()).unwrap_or_default();
        let to = to.map(|d| d.to_string()).unwrap_or_default();
        self.param("from", from).param("to", to)
    }

    #[must_use]
    pub fn page_size(self, size: u32) -> Self {
        self.param(PAGE_SIZE_PARAM, size.to_string())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn page_size_value(&self) -> Option<u32> {
        self.get(PAGE_SIZE_PARAM).and_then(|s| s.parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Query pairs, excluding pagination, for the remote list call.
    pub fn query_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter(|(k, _)| k.as_str() != PAGE_SIZE_PARAM)
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}:{}", k, v)?;
        }
        f.write_str("}")
    }
}

/// The owning entity of a linked sub-collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Parent {
    pub tag: EntityTag,
    pub id: EntityId,
}

impl Parent {
    pub fn sale(id: EntityId) -> Self {
        Self {
            tag: EntityTag::Sales,
            id,
        }
    }

    pub fn purchase(id: EntityId) -> Self {
        Self {
            tag: EntityTag::Purchases,
            id,
        }
    }

    pub fn bank(id: EntityId) -> Self {
        Self {
            tag: EntityTag::Banks,
            id,
        }
    }

    /// Linkage fields carried by a payload (`sale_id`, `purchase_id`,
    /// `bank_id`).
    pub fn from_payload(record: &Record) -> Vec<Parent> {
        [
            ("sale_id", EntityTag::Sales),
            ("purchase_id", EntityTag::Purchases),
            ("bank_id", EntityTag::Banks),
        ]
        .into_iter()
        .filter_map(|(field, tag)| record.integer(field).map(|id| Parent { tag, id }))
        .collect()
    }
}

/// Identifier for one cached collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheKey {
    /// A top-level paged list, e.g. the sales screen.
    List {
        tag: EntityTag,
        filter: FilterDescriptor,
    },
    /// A list scoped to one parent, e.g. the payments of purchase 3.
    Linked {
        tag: EntityTag,
        parent: Parent,
        filter: FilterDescriptor,
    },
    /// A single entity, cached as a one-item collection.
    Detail { tag: EntityTag, id: EntityId },
}

impl CacheKey {
    pub fn list(tag: EntityTag, filter: FilterDescriptor) -> Self {
        CacheKey::List { tag, filter }
    }

    pub fn linked(tag: EntityTag, parent: Parent, filter: FilterDescriptor) -> Self {
        CacheKey::Linked {
            tag,
            parent,
            filter,
        }
    }

    pub fn detail(tag: EntityTag, id: EntityId) -> Self {
        CacheKey::Detail { tag, id }
    }

    pub fn tag(&self) -> EntityTag {
        match self {
            CacheKey::List { tag, .. }
            | CacheKey::Linked { tag, .. }
            | CacheKey::Detail { tag, .. } => *tag,
        }
    }

    pub fn filter(&self) -> Option<&FilterDescriptor> {
        match self {
            CacheKey::List { filter, .. } | CacheKey::Linked { filter, .. } => Some(filter),
            CacheKey::Detail { .. } => None,
        }
    }

    /// Whether the key names a paged view (as opposed to a detail row).
    pub fn is_paged(&self) -> bool {
        !matches!(self, CacheKey::Detail { .. })
    }

    pub fn matches(&self, predicate: &KeyPredicate) -> bool {
        match predicate {
            KeyPredicate::Exact(key) => self == key,
            KeyPredicate::Family(tag) => self.tag() == *tag,
            KeyPredicate::Lists(tag) => {
                matches!(self, CacheKey::List { tag: t, .. } if t == tag)
            }
            KeyPredicate::LinkedTo { tag, parent } => matches!(
                self,
                CacheKey::Linked { tag: t, parent: p, .. } if t == tag && p == parent
            ),
            KeyPredicate::Detail { tag, id } => matches!(
                self,
                CacheKey::Detail { tag: t, id: i } if t == tag && i == id
            ),
            KeyPredicate::FilterEquals { tag, name, value } => {
                self.tag() == *tag
                    && self
                        .filter()
                        .and_then(|f| f.get(name))
                        .is_some_and(|v| v == value)
            }
            KeyPredicate::AnyOf(predicates) => predicates.iter().any(|p| self.matches(p)),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::List { tag, filter } => write!(f, "{}{}", tag, filter),
            CacheKey::Linked {
                tag,
                parent,
                filter,
            } => write!(f, "{}/{}/{}{}", parent.tag, parent.id, tag, filter),
            CacheKey::Detail { tag, id } => write!(f, "{}#{}", tag, id),
        }
    }
}

/// Selects a set of cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPredicate {
    /// Exactly this key.
    Exact(CacheKey),
    /// Every key of the family, regardless of variant or descriptor.
    Family(EntityTag),
    /// Top-level paged lists of the family.
    Lists(EntityTag),
    /// Sub-collections of `tag` owned by `parent`.
    LinkedTo { tag: EntityTag, parent: Parent },
    /// The detail row for one entity.
    Detail { tag: EntityTag, id: EntityId },
    /// Keys of the family whose descriptor has `name == value`.
    FilterEquals {
        tag: EntityTag,
        name: String,
        value: String,
    },
    AnyOf(Vec<KeyPredicate>),
}

impl fmt::Display for KeyPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPredicate::Exact(key) => write!(f, "={}", key),
            KeyPredicate::Family(tag) => write!(f, "{}/*", tag),
            KeyPredicate::Lists(tag) => write!(f, "{}[lists]", tag),
            KeyPredicate::LinkedTo { tag, parent } => {
                write!(f, "{}/{}/{}", parent.tag, parent.id, tag)
            }
            KeyPredicate::Detail { tag, id } => write!(f, "{}#{}", tag, id),
            KeyPredicate::FilterEquals { tag, name, value } => {
                write!(f, "{}[{}={}]", tag, name, value)
            }
            KeyPredicate::AnyOf(ps) => {
                f.write_str("any(")?;
                for (i, p) in ps.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str(")")
            }
        }
    }
}
