//! `tally watch`: keep collections hydrated and follow realtime changes.

use std::path::PathBuf;
use std::sync::Arc;

use miette::Result;
use tally_sync::{
    CacheEvent, CacheKey, CacheStore, DashboardClient, EntityTag, FilterDescriptor,
    SyncConfig, SyncCoordinator, mirror,
};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

pub async fn run(
    config: SyncConfig,
    client: DashboardClient,
    collections: &[EntityTag],
    search: Option<&str>,
    mirror_path: Option<PathBuf>,
) -> Result<()> {
    let store = CacheStore::new();
    if let Some(path) = &mirror_path {
        mirror::load(&store, path).await;
    }

    let page_size = config.default_page_size;
    let coordinator = SyncCoordinator::builder(config)
        .client(Arc::new(client))
        .store(Arc::clone(&store))
        .build()
        .map_err(|e| miette::miette!("{}", e))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = coordinator.start(shutdown_rx.clone());
    let printer = tokio::spawn(print_events(Arc::clone(&store), shutdown_rx));

    let mut views = Vec::with_capacity(collections.len());
    for tag in collections {
        let filter = FilterDescriptor::new()
            .search(search.unwrap_or_default())
            .page_size(page_size);
        let key = CacheKey::list(*tag, filter);
        let view = coordinator
            .watch(key.clone())
            .await
            .map_err(|e| miette::miette!("failed to load {}: {}", key, e))?;
        print_summary(&key, &store);
        views.push(view);
    }

    info!(
        collections = views.len(),
        "watching for changes, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c().await.ok();
    info!("received shutdown signal");

    let _ = shutdown_tx.send(true);
    drop(views);
    handle.join().await;
    if let Err(e) = printer.await {
        warn!(error = %e, "event printer task failed");
    }

    if let Some(path) = &mirror_path {
        mirror::save(&store, path)
            .await
            .map_err(|e| miette::miette!("failed to save cache mirror: {}", e))?;
    }
    Ok(())
}

fn print_summary(key: &CacheKey, store: &CacheStore) {
    let Some(collection) = store.get(key) else {
        println!("{key}: (empty)");
        return;
    };
    let total = collection
        .total()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "?".to_string());
    let ids: Vec<String> = collection.ids().iter().map(|id| id.to_string()).collect();
    println!("{key}: {} of {total} [{}]", ids.len(), ids.join(", "));
}

async fn print_events(store: Arc<CacheStore>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut events = store.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(CacheEvent::Updated { key }) => {
                    if store.is_active(&key) {
                        print_summary(&key, &store);
                    }
                }
                Ok(CacheEvent::Invalidated { key }) => println!("{key}: stale"),
                Ok(CacheEvent::RefetchRequested { .. }) | Ok(CacheEvent::Removed { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
