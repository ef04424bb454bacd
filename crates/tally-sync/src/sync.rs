//! Sync coordinator: wires the store, router, client, push channel and
//! reconciler together.
//!
//! Startup sequence:
//! 1. Attach the reconciler to the push channel (connects lazily)
//! 2. Spawn the refetch loop
//! 3. Views hydrate through [`SyncCoordinator::watch`]

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::SyncError;
use crate::cache::CacheStore;
use crate::channel::{PushChannel, Subscription};
use crate::client::DashboardClient;
use crate::config::SyncConfig;
use crate::invalidation::InvalidationRouter;
use crate::key::CacheKey;
use crate::mutation::{LogNotifier, MutationOutcome, MutationPipeline, MutationPlan, Notifier};
use crate::query::{QueryClient, ViewHandle};
use crate::reconciler::RealtimeReconciler;

/// Handle to a running coordinator's background work.
pub struct SyncHandle {
    refetch_task: JoinHandle<()>,
    subscription: Subscription,
    channel: Arc<PushChannel>,
}

impl SyncHandle {
    /// Detach the reconciler, stop the push channel and wait for the refetch
    /// loop. `shutdown_tx` must already carry `true`.
    pub async fn join(self) {
        drop(self.subscription);
        self.channel.stop().await;
        if let Err(e) = self.refetch_task.await {
            tracing::error!(error = %e, "refetch loop task failed");
        }
    }
}

/// Owns every sync component for one backend.
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<CacheStore>,
    client: Arc<DashboardClient>,
    pipeline: MutationPipeline,
    query: Arc<QueryClient>,
    channel: Arc<PushChannel>,
    reconciler: Arc<RealtimeReconciler>,
}

impl SyncCoordinator {
    pub fn builder(config: SyncConfig) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<CacheStore> {
        Arc::clone(&self.store)
    }

    pub fn client(&self) -> &DashboardClient {
        &self.client
    }

    pub fn pipeline(&self) -> &MutationPipeline {
        &self.pipeline
    }

    pub fn query(&self) -> Arc<QueryClient> {
        Arc::clone(&self.query)
    }

    pub fn channel(&self) -> Arc<PushChannel> {
        Arc::clone(&self.channel)
    }

    /// Follow the push channel and serve refetch requests until
    /// `shutdown_rx` flips to true.
    pub fn start(&self, shutdown_rx: watch::Receiver<bool>) -> SyncHandle {
        info!(
            api = %self.config.api_url,
            events = %self.config.events_url,
            "starting sync coordinator"
        );
        let subscription = self.reconciler.attach(&self.channel);
        let refetch_task = tokio::spawn(Arc::clone(&self.query).run_refetch_loop(shutdown_rx));
        SyncHandle {
            refetch_task,
            subscription,
            channel: Arc::clone(&self.channel),
        }
    }

    /// Keep `key` active and hydrated.
    pub async fn watch(&self, key: CacheKey) -> Result<ViewHandle, SyncError> {
        self.query.watch(key).await
    }

    /// Run a write through the mutation pipeline.
    pub async fn mutate<T, Fut>(
        &self,
        plan: MutationPlan,
        remote: Fut,
    ) -> Result<MutationOutcome<T>, SyncError>
    where
        T: serde::Serialize,
        Fut: std::future::Future<Output = Result<T, SyncError>>,
    {
        self.pipeline.execute(plan, remote).await
    }
}

/// Builder for [`SyncCoordinator`].
pub struct SyncCoordinatorBuilder {
    config: SyncConfig,
    client: Option<Arc<DashboardClient>>,
    store: Option<Arc<CacheStore>>,
    notifier: Arc<dyn Notifier>,
}

impl SyncCoordinatorBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            client: None,
            store: None,
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Use an existing (e.g. already logged in) client.
    #[must_use]
    pub fn client(mut self, client: Arc<DashboardClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Use an existing store, e.g. one seeded from a mirror.
    #[must_use]
    pub fn store(mut self, store: Arc<CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> Result<SyncCoordinator, SyncError> {
        self.config.validate()?;
        let store = self.store.unwrap_or_else(CacheStore::new);
        let client = self
            .client
            .unwrap_or_else(|| Arc::new(DashboardClient::from_config(&self.config)));
        let router = Arc::new(InvalidationRouter::dashboard());

        let pipeline = MutationPipeline::new(Arc::clone(&store), Arc::clone(&router))
            .with_notifier(self.notifier);
        let query = QueryClient::new(Arc::clone(&store), client.clone());
        let channel = PushChannel::new(self.config.events_url.clone(), self.config.reconnect_delay());
        let reconciler = Arc::new(RealtimeReconciler::with_dedup_window(
            Arc::clone(&store),
            router,
            self.config.dedup_window,
        ));

        Ok(SyncCoordinator {
            config: self.config,
            store,
            client,
            pipeline,
            query,
            channel,
            reconciler,
        })
    }
}
