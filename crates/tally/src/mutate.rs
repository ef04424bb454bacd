//! One-shot writes through the mutation pipeline.

use std::sync::Arc;

use miette::Result;
use tally_sync::{
    CacheKey, DashboardClient, EntityId, EntityTag, MutationOutcome, PaymentInput, SyncConfig,
    SyncCoordinator, SyncError, plans,
};
use tracing::info;

fn coordinator(config: SyncConfig, client: DashboardClient) -> Result<SyncCoordinator> {
    SyncCoordinator::builder(config)
        .client(Arc::new(client))
        .build()
        .map_err(|e| miette::miette!("{}", e))
}

fn balance_field(parent: EntityTag) -> &'static str {
    match parent {
        EntityTag::Sales => "remaining_balance",
        _ => "balance",
    }
}

fn cached_balance(coordinator: &SyncCoordinator, key: &CacheKey, id: EntityId, field: &str) -> Option<f64> {
    coordinator
        .store()
        .get(key)
        .and_then(|c| c.find(id).and_then(|r| r.number(field)))
}

/// Record a payment against a purchase or sale.
pub async fn pay(
    config: SyncConfig,
    client: DashboardClient,
    parent: EntityTag,
    id: EntityId,
    input: PaymentInput,
) -> Result<()> {
    let coordinator = coordinator(config, client)?;
    let key = CacheKey::detail(parent, id);
    let field = balance_field(parent);

    let _view = coordinator
        .watch(key.clone())
        .await
        .map_err(|e| miette::miette!("failed to load {} {}: {}", parent, id, e))?;
    let before = cached_balance(&coordinator, &key, id, field);

    let plan = match parent {
        EntityTag::Sales => plans::pay_sale(id, &input),
        _ => plans::pay_purchase(id, &input),
    };
    let remote = async {
        let client = coordinator.client();
        let payment = match parent {
            EntityTag::Sales => client.pay_sale(id, &input).await?,
            _ => client.pay_purchase(id, &input).await?,
        };
        Ok::<_, SyncError>(payment)
    };

    let outcome = coordinator
        .mutate(plan, remote)
        .await
        .map_err(|e| miette::miette!("payment failed: {}", e))?;
    let after = cached_balance(&coordinator, &key, id, field);

    info!(
        payment = outcome.value.id,
        ?before,
        ?after,
        invalidated = outcome.invalidation.invalidated.len(),
        "payment recorded"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&outcome.value).map_err(|e| miette::miette!("{}", e))?
    );
    Ok(())
}

/// Delete an entity.
pub async fn delete(
    config: SyncConfig,
    client: DashboardClient,
    tag: EntityTag,
    id: EntityId,
) -> Result<()> {
    let coordinator = coordinator(config, client)?;
    let remote = async { coordinator.client().delete(tag, id).await };

    let MutationOutcome { confirmation, .. } = coordinator
        .mutate(plans::delete(tag, id), remote)
        .await
        .map_err(|e| miette::miette!("delete failed: {}", e))?;

    match confirmation {
        tally_sync::Confirmation::Message(message) => println!("{message}"),
        _ => println!("deleted {tag} {id}"),
    }
    Ok(())
}
