use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meteor::application::services::execution_coordinator::ExecutionCoordinator;
use meteor::application::services::market_feed::MarketFeed;
use meteor::application::services::order_executor::OrderExecutor;
use meteor::application::services::trigger_monitor::TriggerMonitor;
use meteor::config::EngineConfig;
use meteor::domain::repositories::order_queue::OrderQueue;
use meteor::domain::services::entry_price::EntryPriceCalculator;
use meteor::domain::services::exchange_info_store::ExchangeInfoStore;
use meteor::infrastructure::binance_market::BinanceFuturesClient;
use meteor::infrastructure::channel_queue::ChannelOrderQueue;
use meteor::infrastructure::gateway_registry::GatewayRegistry;
use meteor::infrastructure::memory_lock_store::MemoryLockStore;
use meteor::infrastructure::paper_gateway::PaperAccounts;
use meteor::persistence::init_database;

const FEED_CHANNEL_CAPACITY: usize = 10_000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meteor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = EngineConfig::from_env();
    info!("Meteor execution engine starting");
    info!(
        "Workers: {}, lease: {:?}, market: {}",
        config.executor_workers, config.execution_lock_ttl, config.market_key
    );

    let pool = init_database(&config.database).await?;
    let store = Arc::new(ExchangeInfoStore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut background = Vec::new();
    if config.enable_market_feed {
        let client = Arc::new(BinanceFuturesClient::new()?);
        match client.load_exchange_info().await {
            Ok(symbols) => {
                let depth_symbols: Vec<String> = symbols
                    .iter()
                    .take(config.feed_symbol_limit)
                    .map(|s| s.name().to_string())
                    .collect();
                store.upsert_market(&config.market_key, symbols).await;

                let (events_tx, events_rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
                let feed = MarketFeed::new(
                    config.market_key.clone(),
                    store.clone(),
                    client.clone(),
                    config.depth_snapshot_limit,
                );
                background.push(feed.spawn(events_rx));

                let stream_client = client.clone();
                let stream_shutdown = shutdown_rx.clone();
                background.push(tokio::spawn(async move {
                    stream_client
                        .run_stream(depth_symbols, events_tx, stream_shutdown)
                        .await;
                }));
            }
            Err(e) => error!("✗ Failed to load exchange info, market feed disabled: {}", e),
        }
    } else {
        warn!("Market feed disabled; gateways fall back to stored prices");
    }

    let registry = Arc::new(GatewayRegistry::with_builtin(
        store.clone(),
        Arc::new(EntryPriceCalculator::new()),
        Arc::new(PaperAccounts::new()),
    ));
    info!("Exchange providers: {:?}", registry.provider_keys());

    let queue = Arc::new(ChannelOrderQueue::new(config.order_queue_capacity));
    let executor = Arc::new(OrderExecutor::new(
        pool.clone(),
        registry,
        Arc::new(MemoryLockStore::new()),
        config.execution_lock_ttl,
    ));
    let coordinator = ExecutionCoordinator::new(
        executor,
        queue.clone() as Arc<dyn OrderQueue>,
        config.executor_workers,
    )
    .start();

    let monitor = TriggerMonitor::new(
        pool.clone(),
        store.clone(),
        config.market_key.clone(),
        queue.clone(),
        config.trigger_scan_interval,
        config.trigger_cooldown,
    );
    background.push(monitor.spawn(shutdown_rx.clone()));

    info!("Engine started successfully. Press Ctrl+C to stop.");
    shutdown_signal().await;
    info!("Engine shutting down gracefully...");

    let _ = shutdown_tx.send(true);
    queue.close();
    coordinator.shutdown().await;
    for task in background {
        if let Err(e) = task.await {
            error!("Background task failed: {}", e);
        }
    }

    pool.close().await;
    info!("Engine stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
