//! Core types for dashboard entities.
//!
//! The cache itself is entity-agnostic and stores [`Record`]s. The typed
//! structs below are what the remote client sends and receives; they convert
//! to and from records through serde.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::SyncError;

/// Integer identifier carried by every entity.
pub type EntityId = i64;

/// A collection family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityTag {
    Sales,
    Purchases,
    Transactions,
    Payments,
    /// Paged product catalogue.
    Products,
    /// Unpaged product list used by pickers.
    AllProducts,
    Banks,
    Profit,
}

impl EntityTag {
    pub const ALL: [EntityTag; 8] = [
        EntityTag::Sales,
        EntityTag::Purchases,
        EntityTag::Transactions,
        EntityTag::Payments,
        EntityTag::Products,
        EntityTag::AllProducts,
        EntityTag::Banks,
        EntityTag::Profit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityTag::Sales => "sales",
            EntityTag::Purchases => "purchases",
            EntityTag::Transactions => "transactions",
            EntityTag::Payments => "payments",
            EntityTag::Products => "products",
            EntityTag::AllProducts => "all-products",
            EntityTag::Banks => "banks",
            EntityTag::Profit => "profit",
        }
    }

    /// Map a push-channel resource name to a tag.
    ///
    /// Servers emit both singular and plural names ("sale", "sales").
    pub fn from_resource(resource: &str) -> Option<Self> {
        match resource.trim().to_ascii_lowercase().as_str() {
            "sale" | "sales" => Some(EntityTag::Sales),
            "purchase" | "purchases" => Some(EntityTag::Purchases),
            "transaction" | "transactions" => Some(EntityTag::Transactions),
            "payment" | "payments" => Some(EntityTag::Payments),
            "product" | "products" => Some(EntityTag::Products),
            "all-products" | "all_products" => Some(EntityTag::AllProducts),
            "bank" | "banks" => Some(EntityTag::Banks),
            "profit" | "profits" | "profit_record" | "profit-records" => Some(EntityTag::Profit),
            _ => None,
        }
    }

    /// REST path segment for this family.
    pub fn endpoint(&self) -> &'static str {
        match self {
            EntityTag::AllProducts => "products/all",
            other => other.as_str(),
        }
    }

    /// The derived balance that payments against this family draw down.
    pub fn balance_field(&self) -> Option<&'static str> {
        match self {
            EntityTag::Sales => Some("remaining_balance"),
            EntityTag::Purchases => Some("balance"),
            _ => None,
        }
    }
}

/// Payment field carrying the parent's recalculated balance.
pub const BALANCE_AFTER: &str = "balance_after";

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityTag {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityTag::from_resource(s)
            .ok_or_else(|| SyncError::Config(format!("unknown collection '{}'", s)))
    }
}

/// Kind of committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        })
    }
}

/// An entity as the cache sees it: a JSON object with an integer `id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(id: EntityId) -> Self {
        let mut map = Map::new();
        map.insert("id".to_string(), Value::from(id));
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Serialize a typed entity into a record.
    pub fn from_entity<T: Serialize>(entity: &T) -> Result<Self, SyncError> {
        match serde_json::to_value(entity)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(SyncError::InvalidResponse(format!(
                "expected object, got {}",
                other
            ))),
        }
    }

    /// Deserialize into a typed entity.
    pub fn into_entity<T: DeserializeOwned>(self) -> Result<T, SyncError> {
        Ok(serde_json::from_value(Value::Object(self.0))?)
    }

    /// Identifier, if present and integral.
    pub fn id(&self) -> Option<EntityId> {
        self.0.get("id").and_then(Value::as_i64)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Numeric field as f64. Accepts numbers and numeric strings (decimal
    /// columns are often serialized as strings).
    pub fn number(&self, field: &str) -> Option<f64> {
        match self.0.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer field, accepting numeric strings.
    pub fn integer(&self, field: &str) -> Option<i64> {
        match self.0.get(field)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(field.into(), value.into());
    }

    /// Merge fields in place. Returns true if anything changed.
    pub fn merge(&mut self, fields: &Map<String, Value>) -> bool {
        let mut changed = false;
        for (k, v) in fields {
            if self.0.get(k) != Some(v) {
                self.0.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        changed
    }

    /// True if every field is present and non-null.
    pub fn has_fields(&self, fields: &[&str]) -> bool {
        fields
            .iter()
            .all(|f| self.0.get(*f).is_some_and(|v| !v.is_null()))
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Session tokens returned by login/refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// One page of a list response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub items: Vec<Record>,
    #[serde(alias = "page")]
    pub page_number: u32,
    pub page_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_next: Option<bool>,
}

impl Page {
    pub fn new(page_number: u32, page_size: u32, items: Vec<Record>) -> Self {
        Self {
            items,
            page_number,
            page_size,
            total: None,
            total_pages: None,
            has_next: None,
        }
    }

    #[must_use]
    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        if self.page_size > 0 {
            self.total_pages = Some(total.div_ceil(self.page_size as u64) as u32);
        }
        self.has_next = Some((self.page_number as u64) * (self.page_size as u64) < total);
        self
    }

    /// Whether another page can be fetched after this one.
    pub fn next_page(&self) -> Option<u32> {
        let more = match (self.has_next, self.total_pages) {
            (Some(has_next), _) => has_next,
            (None, Some(pages)) => self.page_number < pages,
            (None, None) => self.items.len() as u32 >= self.page_size && self.page_size > 0,
        };
        more.then_some(self.page_number + 1)
    }
}

// =============================================================================
// Typed entities
// =============================================================================

/// A sale. `remaining_balance` is derived from the sale's payments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    pub id: EntityId,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub product_id: Option<EntityId>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub quantity: i64,
    pub total_amount: f64,
    #[serde(default)]
    pub paid_amount: f64,
    pub remaining_balance: f64,
    pub status: String,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A purchase. `balance` is derived from the purchase's payments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    pub id: EntityId,
    #[serde(default)]
    pub supplier_name: Option<String>,
    #[serde(default)]
    pub product_id: Option<EntityId>,
    #[serde(default)]
    pub quantity: i64,
    pub total_amount: f64,
    #[serde(default)]
    pub paid_amount: f64,
    pub balance: f64,
    pub status: String,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A bank transaction. `bank_name` and `type_display` are denormalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: EntityId,
    #[serde(default)]
    pub bank_id: Option<EntityId>,
    #[serde(default)]
    pub bank_name: Option<String>,
    #[serde(default)]
    pub sale_id: Option<EntityId>,
    #[serde(default)]
    pub purchase_id: Option<EntityId>,
    pub amount: f64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub type_display: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

/// A payment against a sale or a purchase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: EntityId,
    #[serde(default)]
    pub sale_id: Option<EntityId>,
    #[serde(default)]
    pub purchase_id: Option<EntityId>,
    #[serde(default)]
    pub bank_id: Option<EntityId>,
    pub amount: f64,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    /// Parent's remaining balance after this payment, as recalculated by the
    /// server.
    #[serde(default)]
    pub balance_after: Option<f64>,
}

/// Request body for recording a payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentInput {
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bank_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub cost: f64,
}

/// A bank account. `balance` is implied by its transactions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bank {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub balance: Option<f64>,
}

/// Profit booked for a sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfitRecord {
    pub id: EntityId,
    #[serde(default)]
    pub sale_id: Option<EntityId>,
    pub amount: f64,
    #[serde(default)]
    pub date: Option<NaiveDate>,
}
