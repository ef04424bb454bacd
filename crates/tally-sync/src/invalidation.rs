//! Invalidation routing.
//!
//! A committed write to one entity denormalizes into other cached
//! collections: deleting a sale restores product stock, removes its profit
//! record and its bank transactions. The router is a static table from
//! `(EntityTag, Action)` to an ordered list of [`Route`]s, shared by the
//! mutation pipeline and the realtime reconciler.
//!
//! # Adding a route
//!
//! Add one line to the `define_invalidation_routes!` invocation at the bottom
//! of this file:
//!
//! ```ignore
//! Banks, Updated => [family(EntityTag::Transactions); All];
//! ```
//!
//! Targets that read ids from the payload (`detail`, `linked`, `this`,
//! `parent_lists`, `unsettled`) are resolved per write; if the payload lacks
//! the field the route is skipped and the remaining routes still run.
//!
//! `unsettled` targets also resolve to nothing when the payload already
//! carries the authoritative value, since the commit step has written it in
//! place and a refetch would show nothing new.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::{CacheStore, Scope};
use crate::key::{CacheKey, KeyPredicate, Parent};
use crate::types::{Action, BALANCE_AFTER, EntityTag, Record};

/// What a route points at, possibly parameterized by the write's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every collection of a family.
    Family(EntityTag),
    /// Top-level lists of a family.
    Lists(EntityTag),
    /// The detail row of the written entity itself.
    This,
    /// The detail row of another entity whose id is in `field`.
    Detail { tag: EntityTag, field: &'static str },
    /// Sub-collections of `tag` owned by the `parent` entity whose id is in
    /// `field`.
    Linked {
        tag: EntityTag,
        parent: EntityTag,
        field: &'static str,
    },
    /// Top-level lists of `tag`, only if the payload links to one of its
    /// entities through `field`.
    ParentLists { tag: EntityTag, field: &'static str },
    /// Like `Detail`, but nothing when the payload carries `settled_by`.
    Unsettled {
        tag: EntityTag,
        field: &'static str,
        settled_by: &'static str,
    },
}

/// A route could not be resolved against a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("payload has no integer '{0}' field")]
    MissingField(&'static str),
}

impl Target {
    /// Resolve into a concrete predicate for a write of `tag` carrying
    /// `payload`. `Ok(None)` means the route has nothing left to do.
    pub fn resolve(
        &self,
        tag: EntityTag,
        payload: &Record,
    ) -> Result<Option<KeyPredicate>, RouteError> {
        let id_of = |field: &'static str| {
            payload
                .integer(field)
                .ok_or(RouteError::MissingField(field))
        };
        Ok(Some(match self {
            Target::Family(t) => KeyPredicate::Family(*t),
            Target::Lists(t) => KeyPredicate::Lists(*t),
            Target::This => KeyPredicate::Detail {
                tag,
                id: id_of("id")?,
            },
            Target::Detail { tag, field } => KeyPredicate::Detail {
                tag: *tag,
                id: id_of(field)?,
            },
            Target::Linked { tag, parent, field } => KeyPredicate::LinkedTo {
                tag: *tag,
                parent: Parent {
                    tag: *parent,
                    id: id_of(field)?,
                },
            },
            Target::ParentLists { tag, field } => {
                id_of(field)?;
                KeyPredicate::Lists(*tag)
            }
            Target::Unsettled {
                tag,
                field,
                settled_by,
            } => {
                let id = id_of(field)?;
                if payload.get(settled_by).is_some_and(|v| !v.is_null()) {
                    return Ok(None);
                }
                KeyPredicate::Detail { tag: *tag, id }
            }
        }))
    }
}

/// One invalidation side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: Target,
    pub scope: Scope,
}

impl Route {
    pub fn new(target: Target, scope: Scope) -> Self {
        Self { target, scope }
    }
}

/// Outcome of applying a route list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationReport {
    /// Keys marked stale, in application order, without duplicates.
    pub invalidated: Vec<CacheKey>,
    /// Routes that could not be resolved.
    pub skipped: Vec<RouteError>,
}

/// Static `(entity, action) -> routes` table.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRouter {
    routes: HashMap<(EntityTag, Action), Vec<Route>>,
}

impl InvalidationRouter {
    /// A router with no routes.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The dashboard's routing table.
    pub fn dashboard() -> Self {
        let mut router = Self::empty();
        dashboard_routes(&mut router);
        router
    }

    /// Append a route. Routes run in registration order.
    pub fn register(&mut self, tag: EntityTag, action: Action, route: Route) {
        self.routes.entry((tag, action)).or_default().push(route);
    }

    pub fn routes(&self, tag: EntityTag, action: Action) -> &[Route] {
        self.routes
            .get(&(tag, action))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolve every route for a write, in registration order. Routes with
    /// nothing left to do are left out.
    pub fn resolve(
        &self,
        tag: EntityTag,
        action: Action,
        payload: &Record,
    ) -> Vec<Result<(KeyPredicate, Scope), RouteError>> {
        self.routes(tag, action)
            .iter()
            .filter_map(|route| match route.target.resolve(tag, payload) {
                Ok(Some(pred)) => Some(Ok((pred, route.scope))),
                Ok(None) => None,
                Err(e) => Some(Err(e)),
            })
            .collect()
    }

    /// Invalidate everything routed for `(tag, action)`.
    ///
    /// Routes are independent: one that cannot be resolved is skipped and the
    /// rest still run.
    pub fn apply(
        &self,
        store: &CacheStore,
        tag: EntityTag,
        action: Action,
        payload: &Record,
    ) -> InvalidationReport {
        let mut report = InvalidationReport::default();
        for resolved in self.resolve(tag, action, payload) {
            match resolved {
                Ok((predicate, scope)) => {
                    trace!(predicate = %predicate, ?scope, "invalidating");
                    for key in store.invalidate(&predicate, scope) {
                        if !report.invalidated.contains(&key) {
                            report.invalidated.push(key);
                        }
                    }
                }
                Err(e) => {
                    trace!(tag = %tag, action = %action, error = %e, "route skipped");
                    report.skipped.push(e);
                }
            }
        }
        debug!(
            tag = %tag,
            action = %action,
            invalidated = report.invalidated.len(),
            skipped = report.skipped.len(),
            "invalidation routed"
        );
        report
    }
}

fn family(tag: EntityTag) -> Target {
    Target::Family(tag)
}

fn lists(tag: EntityTag) -> Target {
    Target::Lists(tag)
}

fn this() -> Target {
    Target::This
}

fn linked(tag: EntityTag, parent: EntityTag, field: &'static str) -> Target {
    Target::Linked { tag, parent, field }
}

fn parent_lists(tag: EntityTag, field: &'static str) -> Target {
    Target::ParentLists { tag, field }
}

fn unsettled(tag: EntityTag, field: &'static str) -> Target {
    Target::Unsettled {
        tag,
        field,
        settled_by: BALANCE_AFTER,
    }
}

/// Generates `dashboard_routes()` from a compact table.
///
/// ```ignore
/// define_invalidation_routes! {
///     Sales, Deleted => [family(EntityTag::Sales); All, family(EntityTag::Profit); All];
/// }
/// ```
macro_rules! define_invalidation_routes {
    (
        $( $tag:ident, $action:ident => [ $( $target:expr ; $scope:ident ),* $(,)? ] );*
        $(;)?
    ) => {
        fn dashboard_routes(router: &mut InvalidationRouter) {
            $(
                $(
                    router.register(
                        EntityTag::$tag,
                        Action::$action,
                        Route::new($target, Scope::$scope),
                    );
                )*
            )*
        }
    };
}

define_invalidation_routes! {
    Sales, Created => [
        family(EntityTag::Sales); All,
        family(EntityTag::Products); All,
        family(EntityTag::AllProducts); All,
        family(EntityTag::Profit); All,
        family(EntityTag::Transactions); All,
        family(EntityTag::Banks); All,
    ];
    Sales, Updated => [
        this(); All,
        lists(EntityTag::Sales); Active,
        linked(EntityTag::Transactions, EntityTag::Sales, "id"); All,
        linked(EntityTag::Payments, EntityTag::Sales, "id"); All,
        family(EntityTag::Profit); All,
    ];
    Sales, Deleted => [
        family(EntityTag::Sales); All,
        linked(EntityTag::Transactions, EntityTag::Sales, "id"); All,
        family(EntityTag::Products); All,
        family(EntityTag::AllProducts); All,
        family(EntityTag::Profit); All,
    ];
    Purchases, Created => [
        family(EntityTag::Purchases); All,
        family(EntityTag::Products); All,
        family(EntityTag::AllProducts); All,
        family(EntityTag::Transactions); All,
    ];
    Purchases, Updated => [
        this(); All,
        lists(EntityTag::Purchases); Active,
        linked(EntityTag::Transactions, EntityTag::Purchases, "id"); All,
    ];
    Purchases, Deleted => [
        family(EntityTag::Purchases); All,
        linked(EntityTag::Transactions, EntityTag::Purchases, "id"); All,
        linked(EntityTag::Payments, EntityTag::Purchases, "id"); All,
        family(EntityTag::Products); All,
        family(EntityTag::AllProducts); All,
    ];
    Payments, Created => [
        unsettled(EntityTag::Purchases, "purchase_id"); All,
        unsettled(EntityTag::Sales, "sale_id"); All,
        parent_lists(EntityTag::Purchases, "purchase_id"); All,
        parent_lists(EntityTag::Sales, "sale_id"); All,
        family(EntityTag::Transactions); All,
        linked(EntityTag::Payments, EntityTag::Purchases, "purchase_id"); All,
        linked(EntityTag::Payments, EntityTag::Sales, "sale_id"); All,
        family(EntityTag::Banks); All,
    ];
    Payments, Updated => [
        unsettled(EntityTag::Purchases, "purchase_id"); All,
        unsettled(EntityTag::Sales, "sale_id"); All,
        parent_lists(EntityTag::Purchases, "purchase_id"); All,
        parent_lists(EntityTag::Sales, "sale_id"); All,
        family(EntityTag::Transactions); All,
        linked(EntityTag::Payments, EntityTag::Purchases, "purchase_id"); All,
        linked(EntityTag::Payments, EntityTag::Sales, "sale_id"); All,
    ];
    Payments, Deleted => [
        unsettled(EntityTag::Purchases, "purchase_id"); All,
        unsettled(EntityTag::Sales, "sale_id"); All,
        parent_lists(EntityTag::Purchases, "purchase_id"); All,
        parent_lists(EntityTag::Sales, "sale_id"); All,
        family(EntityTag::Transactions); All,
        linked(EntityTag::Payments, EntityTag::Purchases, "purchase_id"); All,
        linked(EntityTag::Payments, EntityTag::Sales, "sale_id"); All,
        family(EntityTag::Banks); All,
    ];
    Transactions, Created => [
        family(EntityTag::Transactions); All,
        family(EntityTag::Banks); All,
    ];
    Transactions, Updated => [
        family(EntityTag::Transactions); All,
        family(EntityTag::Banks); All,
    ];
    Transactions, Deleted => [
        family(EntityTag::Transactions); All,
        family(EntityTag::Banks); All,
    ];
    Products, Created => [
        family(EntityTag::Products); All,
        family(EntityTag::AllProducts); All,
    ];
    Products, Updated => [
        family(EntityTag::Products); All,
        family(EntityTag::AllProducts); All,
    ];
    Products, Deleted => [
        family(EntityTag::Products); All,
        family(EntityTag::AllProducts); All,
    ];
    Banks, Created => [
        family(EntityTag::Banks); All,
    ];
    Banks, Updated => [
        family(EntityTag::Banks); All,
        family(EntityTag::Transactions); All,
    ];
    Banks, Deleted => [
        family(EntityTag::Banks); All,
        family(EntityTag::Transactions); All,
    ];
    Profit, Created => [
        family(EntityTag::Profit); All,
    ];
    Profit, Updated => [
        family(EntityTag::Profit); All,
    ];
    Profit, Deleted => [
        family(EntityTag::Profit); All,
    ];
}
