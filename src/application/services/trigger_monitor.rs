//! Trigger Monitor
//!
//! Periodically compares the open orders of open positions with the current
//! symbol prices and publishes an execution signal for every order whose
//! condition is met. A published order is not republished until its cooldown
//! elapses; repeats are harmless since execution re-derives state from the
//! order id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::errors::{ExecutionError, QueueError};
use crate::domain::repositories::order_queue::{OrderMessage, OrderQueue};
use crate::domain::services::exchange_info_store::ExchangeInfoStore;
use crate::persistence::repository::OrderRepository;
use crate::persistence::DbPool;

pub struct TriggerMonitor {
    pool: DbPool,
    store: Arc<ExchangeInfoStore>,
    market: String,
    queue: Arc<dyn OrderQueue>,
    interval: Duration,
    cooldown: Duration,
    published: HashMap<Uuid, Instant>,
}

impl TriggerMonitor {
    pub fn new(
        pool: DbPool,
        store: Arc<ExchangeInfoStore>,
        market: impl Into<String>,
        queue: Arc<dyn OrderQueue>,
        interval: Duration,
        cooldown: Duration,
    ) -> Self {
        Self {
            pool,
            store,
            market: market.into(),
            queue,
            interval,
            cooldown,
            published: HashMap::new(),
        }
    }

    pub fn spawn(mut self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("Trigger monitor started ({:?} interval)", self.interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.scan().await {
                        Ok(0) => {}
                        Ok(count) => debug!("Published {} triggered orders", count),
                        Err(e) => error!("Trigger scan failed: {}", e),
                    },
                    _ = shutdown.changed() => break,
                }
            }

            info!("Trigger monitor stopped");
        })
    }

    /// One pass over the armed orders; returns how many were published
    pub async fn scan(&mut self) -> Result<usize, ExecutionError> {
        let mut conn = self.pool.acquire().await?;
        let orders = OrderRepository::list_armed(&mut conn).await?;
        drop(conn);

        let now = Instant::now();
        let cooldown = self.cooldown;
        self.published
            .retain(|_, at| now.duration_since(*at) < cooldown);

        let mut count = 0;
        for order in orders {
            if self.published.contains_key(&order.id) {
                continue;
            }

            let Some(symbol) = self.store.symbol(&self.market, &order.symbol).await else {
                continue;
            };
            let Some(price) = symbol.prices().await.reference_price() else {
                continue;
            };
            if !order.is_triggered(price) {
                continue;
            }

            match self.queue.publish(OrderMessage { order_id: order.id }).await {
                Ok(()) => {
                    info!(
                        "Order {} triggered at {} ({} {})",
                        order.id, price, order.trigger_type, order.trigger_price
                    );
                    self.published.insert(order.id, now);
                    count += 1;
                }
                Err(QueueError::Closed) => {
                    warn!("Order queue closed, stopping scan");
                    break;
                }
                Err(e) => warn!("Failed to publish order {}: {}", order.id, e),
            }
        }

        Ok(count)
    }
}
