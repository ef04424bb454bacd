//! Mutation pipeline: optimistic patch, remote write, commit or rollback.
//!
//! ```text
//! execute(plan, remote)
//!   |-- apply plan.optimistic to the store, snapshot every touched collection
//!   |-- await remote                       (the only suspension point)
//!   |-- Ok(value)   -> overwrite guesses with confirmed values,
//!   |                  run on_commit, route invalidations
//!   |-- Err(Cancelled) -> return silently, nothing restored
//!   `-- Err(e)      -> restore snapshots, notify, run on_rollback
//! ```
//!
//! Snapshots are taken immediately before this mutation's own patch and only
//! for collections the patch actually changed. Concurrent mutations do not
//! see each other's rollbacks; the invalidation step is what eventually
//! reconciles them with the server.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SyncError;
use crate::cache::{CacheStore, Scope, Snapshot};
use crate::invalidation::{InvalidationReport, InvalidationRouter};
use crate::key::KeyPredicate;
use crate::patch::PatchOp;
use crate::types::{Action, EntityTag, Record};

/// Surfaces failed mutations to the user.
pub trait Notifier: Send + Sync {
    fn mutation_failed(&self, tag: EntityTag, action: Action, error: &SyncError);
}

/// Default notifier: a `warn!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn mutation_failed(&self, tag: EntityTag, action: Action, error: &SyncError) {
        warn!(tag = %tag, action = %action, error = %error, "mutation failed");
    }
}

pub type CommitHook = Box<dyn FnOnce(&CacheStore, &Record) + Send>;
pub type RollbackHook = Box<dyn FnOnce(&SyncError) + Send>;

/// A speculative change applied before the server confirms.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticPatch {
    pub predicate: KeyPredicate,
    pub scope: Scope,
    pub op: PatchOp,
}

/// Everything the pipeline needs to know about one write besides the remote
/// call itself.
pub struct MutationPlan {
    pub tag: EntityTag,
    pub action: Action,
    /// What the client already knows about the written entity. Merged under
    /// the confirmed payload to build the routing payload, so deletes (whose
    /// response is a bare message) still route by id.
    pub subject: Record,
    pub optimistic: Vec<OptimisticPatch>,
    pub on_commit: Option<CommitHook>,
    pub on_rollback: Option<RollbackHook>,
}

impl MutationPlan {
    pub fn new(tag: EntityTag, action: Action, subject: Record) -> Self {
        Self {
            tag,
            action,
            subject,
            optimistic: Vec::new(),
            on_commit: None,
            on_rollback: None,
        }
    }

    /// Add an optimistic patch over every matching collection.
    #[must_use]
    pub fn patch(mut self, predicate: KeyPredicate, op: PatchOp) -> Self {
        self.optimistic.push(OptimisticPatch {
            predicate,
            scope: Scope::All,
            op,
        });
        self
    }

    /// Add an optimistic patch over observed collections only.
    #[must_use]
    pub fn patch_active(mut self, predicate: KeyPredicate, op: PatchOp) -> Self {
        self.optimistic.push(OptimisticPatch {
            predicate,
            scope: Scope::Active,
            op,
        });
        self
    }

    #[must_use]
    pub fn on_commit(mut self, hook: impl FnOnce(&CacheStore, &Record) + Send + 'static) -> Self {
        self.on_commit = Some(Box::new(hook));
        self
    }

    #[must_use]
    pub fn on_rollback(mut self, hook: impl FnOnce(&SyncError) + Send + 'static) -> Self {
        self.on_rollback = Some(Box::new(hook));
        self
    }
}

impl std::fmt::Debug for MutationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationPlan")
            .field("tag", &self.tag)
            .field("action", &self.action)
            .field("subject", &self.subject)
            .field("optimistic", &self.optimistic)
            .finish_non_exhaustive()
    }
}

/// What the server said about a successful write.
#[derive(Debug, Clone, PartialEq)]
pub enum Confirmation {
    /// The authoritative entity.
    Entity(Record),
    /// A bare `{ "message": ... }` acknowledgement.
    Message(String),
    /// Anything else (no body, non-object body).
    Empty,
}

impl Confirmation {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => {
                if map.get("id").and_then(Value::as_i64).is_some() {
                    Confirmation::Entity(Record::from_map(map))
                } else if let Some(Value::String(message)) = map.get("message") {
                    Confirmation::Message(message.clone())
                } else {
                    Confirmation::Empty
                }
            }
            _ => Confirmation::Empty,
        }
    }

    pub fn entity(&self) -> Option<&Record> {
        match self {
            Confirmation::Entity(record) => Some(record),
            _ => None,
        }
    }
}

/// Result of a committed mutation.
#[derive(Debug)]
pub struct MutationOutcome<T> {
    pub value: T,
    pub confirmation: Confirmation,
    pub invalidation: InvalidationReport,
}

/// Runs writes against the shared cache.
pub struct MutationPipeline {
    store: Arc<CacheStore>,
    router: Arc<InvalidationRouter>,
    notifier: Arc<dyn Notifier>,
    /// In-flight supersedable writes by logical target.
    in_flight: DashMap<String, (u64, CancellationToken)>,
    generation: AtomicU64,
}

impl MutationPipeline {
    pub fn new(store: Arc<CacheStore>, router: Arc<InvalidationRouter>) -> Self {
        Self {
            store,
            router,
            notifier: Arc::new(LogNotifier),
            in_flight: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Run one write.
    pub async fn execute<T, Fut>(
        &self,
        plan: MutationPlan,
        remote: Fut,
    ) -> Result<MutationOutcome<T>, SyncError>
    where
        T: Serialize,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let MutationPlan {
            tag,
            action,
            subject,
            optimistic,
            on_commit,
            on_rollback,
        } = plan;

        let mut snapshots: Vec<Snapshot> = Vec::new();
        for patch in &optimistic {
            snapshots.extend(
                self.store
                    .patch_matching(&patch.predicate, patch.scope, |_, current| {
                        patch.op.apply(current?)
                    }),
            );
        }
        debug!(
            tag = %tag,
            action = %action,
            touched = snapshots.len(),
            "optimistic patch applied"
        );

        let value = match remote.await {
            Ok(value) => value,
            Err(e) if e.is_cancellation() => {
                debug!(tag = %tag, action = %action, "mutation superseded");
                return Err(e);
            }
            Err(e) => {
                self.store.restore(&snapshots);
                warn!(
                    tag = %tag,
                    action = %action,
                    restored = snapshots.len(),
                    error = %e,
                    "remote write failed, optimistic patch rolled back"
                );
                self.notifier.mutation_failed(tag, action, &e);
                if let Some(hook) = on_rollback {
                    hook(&e);
                }
                return Err(e);
            }
        };

        let confirmation = match serde_json::to_value(&value) {
            Ok(v) => Confirmation::from_value(v),
            Err(e) => {
                warn!(error = %e, "confirmed payload not serializable");
                Confirmation::Empty
            }
        };

        if let Some(confirmed) = confirmation.entity() {
            for patch in &optimistic {
                if let Some(op) = patch.op.commit_with(confirmed) {
                    self.store
                        .patch_matching(&patch.predicate, patch.scope, |_, current| {
                            op.apply(current?)
                        });
                }
            }
        }

        let mut payload = subject;
        if let Some(confirmed) = confirmation.entity() {
            payload.merge(confirmed.fields());
        }

        if let Some(hook) = on_commit {
            hook(&self.store, &payload);
        }

        let invalidation = self.router.apply(&self.store, tag, action, &payload);
        info!(
            tag = %tag,
            action = %action,
            id = ?payload.id(),
            invalidated = invalidation.invalidated.len(),
            "mutation committed"
        );

        Ok(MutationOutcome {
            value,
            confirmation,
            invalidation,
        })
    }

    /// Run a write that supersedes any in-flight write with the same
    /// `target`. The superseded call's token is cancelled and its eventual
    /// response ignored.
    ///
    /// The superseded call's optimistic patch is never rolled back, so it is
    /// part of the snapshot this call takes. If this call then fails, the
    /// restored state still holds that uncommitted estimate; every collection
    /// the plan patches is marked stale so the next fetch replaces it.
    pub async fn execute_superseding<T, F, Fut>(
        &self,
        target: &str,
        plan: MutationPlan,
        remote: F,
    ) -> Result<MutationOutcome<T>, SyncError>
    where
        T: Serialize,
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let mut inherited = Vec::new();
        if let Some((_, previous)) = self
            .in_flight
            .insert(target.to_string(), (generation, token.clone()))
        {
            debug!(target = %target, "superseding in-flight mutation");
            previous.cancel();
            inherited = plan
                .optimistic
                .iter()
                .map(|patch| patch.predicate.clone())
                .collect();
        }

        let call = remote(token.clone());
        let guarded = async {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(SyncError::Cancelled),
                result = call => {
                    if token.is_cancelled() {
                        Err(SyncError::Cancelled)
                    } else {
                        result
                    }
                }
            }
        };

        let result = self.execute(plan, guarded).await;
        self.in_flight
            .remove_if(target, |_, (g, _)| *g == generation);
        if let Err(e) = &result
            && !e.is_cancellation()
            && !inherited.is_empty()
        {
            let stale: usize = inherited
                .iter()
                .map(|predicate| self.store.invalidate(predicate, Scope::All).len())
                .sum();
            debug!(target = %target, stale, "superseded estimate left after rollback, invalidated");
        }
        result
    }
}
