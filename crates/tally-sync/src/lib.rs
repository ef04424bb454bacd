//! Client-side cache consistency for the tally dashboard.
//!
//! Keeps paginated, filtered views of server entities consistent with the
//! server and with each other while writes are in flight and while other
//! clients change data concurrently.
//!
//! ## Components
//!
//! - **Cache Store** ([`CacheStore`]): paged collections keyed by [`CacheKey`]
//! - **Mutation Pipeline** ([`MutationPipeline`]): optimistic patch, remote
//!   write, then commit or exact rollback
//! - **Invalidation Router** ([`InvalidationRouter`]): `(entity, action)` to
//!   the keys that must be refetched
//! - **Push Channel** ([`PushChannel`]): one shared WebSocket with automatic
//!   reconnect
//! - **Realtime Reconciler** ([`RealtimeReconciler`]): replays pushed events as
//!   cache patches and invalidations
//!
//! [`SyncCoordinator`] wires them together against a [`DashboardClient`].

pub mod cache;
pub mod channel;
mod client;
mod config;
mod error;
pub mod invalidation;
pub mod key;
pub mod mirror;
pub mod mutation;
pub mod patch;
pub mod plans;
pub mod query;
pub mod reconciler;
pub mod sync;
mod types;

pub use cache::{CacheEvent, CacheStore, CachedCollection, Scope, Snapshot, ViewGuard};
pub use channel::{
    ChannelState, Connector, DEFAULT_RECONNECT_DELAY, PushChannel, PushMessage, Subscription,
    WebSocketConnector,
};
pub use client::DashboardClient;
pub use config::{SyncConfig, SyncConfigBuilder};
pub use error::SyncError;
pub use invalidation::{InvalidationReport, InvalidationRouter, Route, Target};
pub use key::{CacheKey, FilterDescriptor, KeyPredicate, Parent};
pub use mutation::{
    Confirmation, LogNotifier, MutationOutcome, MutationPipeline, MutationPlan, Notifier,
    OptimisticPatch,
};
pub use patch::PatchOp;
pub use query::{PageSource, QueryClient, ViewHandle};
pub use reconciler::{Reconciled, RealtimeReconciler};
pub use sync::{SyncCoordinator, SyncCoordinatorBuilder, SyncHandle};
pub use types::*;
