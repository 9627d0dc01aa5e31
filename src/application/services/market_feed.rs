//! Market Feed
//!
//! Applies decoded stream events to the [`ExchangeInfoStore`]: ticker and mark
//! prices go to the symbol, depth diffs to its order book. When a book asks
//! for a snapshot the feed fetches one in the background; diffs arriving in
//! the meantime are buffered by the book itself.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::domain::entities::order_book::UpdateOutcome;
use crate::domain::repositories::market_data::{DepthSnapshotSource, FeedEvent};
use crate::domain::services::exchange_info_store::{ExchangeInfoStore, SymbolInfo};

const MAX_RESYNC_ATTEMPTS: u32 = 3;

pub struct MarketFeed {
    market: String,
    store: Arc<ExchangeInfoStore>,
    snapshots: Arc<dyn DepthSnapshotSource>,
    snapshot_limit: u32,
}

impl MarketFeed {
    pub fn new(
        market: impl Into<String>,
        store: Arc<ExchangeInfoStore>,
        snapshots: Arc<dyn DepthSnapshotSource>,
        snapshot_limit: u32,
    ) -> Self {
        Self {
            market: market.into(),
            store,
            snapshots,
            snapshot_limit,
        }
    }

    /// Consumes `events` until the sending side closes
    pub fn spawn(self, mut events: mpsc::Receiver<FeedEvent>) -> JoinHandle<()> {
        let feed = Arc::new(self);
        tokio::spawn(async move {
            info!("Market feed for {} started", feed.market);
            while let Some(event) = events.recv().await {
                feed.handle(event).await;
            }
            info!("Market feed for {} stopped", feed.market);
        })
    }

    pub async fn handle(self: &Arc<Self>, event: FeedEvent) {
        let Some(symbol) = self.store.symbol(&self.market, event.symbol()).await else {
            trace!("No symbol {} on {}", event.symbol(), self.market);
            return;
        };

        match event {
            FeedEvent::Ticker { price, .. } => symbol.set_last_price(price).await,
            FeedEvent::MarkPrice { price, .. } => symbol.set_mark_price(price).await,
            FeedEvent::Depth { update, .. } => {
                let outcome = symbol.order_book().write().await.apply_update(update);
                if outcome == UpdateOutcome::SnapshotRequired {
                    debug!("Order book {} needs a snapshot", symbol.name());
                    let feed = self.clone();
                    tokio::spawn(async move { feed.resync(symbol).await });
                }
            }
        }
    }

    /// Loads a fresh snapshot into the symbol's book.
    ///
    /// A snapshot the buffered diffs do not continue is refetched a bounded
    /// number of times; after a failed fetch the next diff starts over.
    pub async fn resync(&self, symbol: Arc<SymbolInfo>) {
        for attempt in 1..=MAX_RESYNC_ATTEMPTS {
            let snapshot = match self
                .snapshots
                .fetch_depth(symbol.name(), self.snapshot_limit)
                .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!("Snapshot fetch for {} failed: {}", symbol.name(), e);
                    break;
                }
            };

            let last_update_id = snapshot.last_update_id;
            let outcome = symbol.order_book().write().await.load_snapshot(snapshot);
            if outcome != UpdateOutcome::SnapshotRequired {
                info!(
                    "Order book {} synchronized at {}",
                    symbol.name(),
                    last_update_id
                );
                return;
            }
            warn!(
                "Snapshot {} of {} is behind the stream (attempt {})",
                last_update_id,
                symbol.name(),
                attempt
            );
        }

        symbol.order_book().write().await.snapshot_failed();
    }
}
