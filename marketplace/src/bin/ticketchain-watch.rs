//! Ticketchain watcher
//!
//! Connects to the configured node, loads the marketplace view model and keeps
//! it reconciled with contract notifications until interrupted.
//!
//! # Usage
//!
//! ```bash
//! TICKETCHAIN_RPC_URL=http://127.0.0.1:8545 \
//! TICKETCHAIN_CONTRACT_ADDRESS=0x63b7accbee71a6a026a0bdc3a0734d74384ed15c \
//! cargo run --bin ticketchain-watch
//! ```

use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;
use ticketchain_marketplace::{Config, Marketplace};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ticketchain=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        rpc_url = %config.rpc_url,
        contract = %config.contract_address,
        chain_id = config.chain_id,
        enumeration = %config.enumeration,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(%addr, "Prometheus metrics exported");
    }

    let marketplace = Marketplace::connect(config).await?;
    marketplace.refresh().await?;

    for event in marketplace.events().await {
        tracing::info!(
            event = %event.record.event_id,
            name = %event.record.name,
            price_eth = %event.record.original_price.to_ether(),
            cap_eth = %event.record.max_resale_price.to_ether(),
            "Event"
        );
    }
    for listing in marketplace.listings().await {
        tracing::info!(
            token = %listing.token_id(),
            event = %listing.event_name,
            price_eth = ?listing.record.listing_price.map(|p| p.to_ether()),
            "Listing"
        );
    }
    if let Some(account) = marketplace.account().await {
        let owned = marketplace.my_tickets().await;
        tracing::info!(account = %account, tickets = owned.len(), "Account loaded");
    }

    let from = marketplace.head().await?.next();
    let (handle, task) = marketplace.watch(from);
    tracing::info!(%handle, %from, "Watching contract notifications, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down");
    marketplace.unwatch(handle);
    task.await?;
    marketplace.shutdown(Duration::from_secs(5)).await?;
    Ok(())
}
