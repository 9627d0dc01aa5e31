//! Order Executor
//!
//! Runs one execution attempt end to end: load the order and its bot,
//! resolve the exchange gateway, take the bot's lease, call the gateway and
//! apply the result to the ledger. Ledger changes and the attempt's audit
//! trail are committed in one transaction; a failed ledger update rolls back
//! and still persists the audits in a transaction of their own.

use futures_util::FutureExt;
use rust_decimal::Decimal;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::entities::audit::{new_correlation_id, AuditEntry, AuditStamp, AuditType};
use crate::domain::entities::bot::Bot;
use crate::domain::entities::exchange::MarginType;
use crate::domain::entities::order::{Order, QuantityType, TriggerType};
use crate::domain::entities::position::{Position, PositionSide};
use crate::domain::errors::{ExecutionError, LedgerError};
use crate::domain::repositories::exchange_gateway::{ExchangeGateway, OrderKind, OrderRequest};
use crate::domain::repositories::lock_store::{LeaseToken, LockStore};
use crate::domain::repositories::order_queue::OrderMessage;
use crate::domain::services::position_ledger::{LedgerOutcome, PositionLedger};
use crate::infrastructure::gateway_registry::GatewayRegistry;
use crate::persistence::repository::{
    AuditRepository, BotRepository, ExchangeRepository, OrderRepository, PositionRepository,
};
use crate::persistence::DbPool;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Why an attempt stopped before reaching the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OrderNotFound,
    AlreadyTerminal,
    BotNotFound,
    BotDisabled,
    ExchangeNotFound,
    ProviderUnavailable,
    Busy,
    PositionAlreadyOpen,
    NoOpenPosition,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Executed {
        correlation_id: String,
        success: bool,
        ledger: LedgerOutcome,
    },
    Skipped(SkipReason),
}

/// Request to open (or grow) a bot's position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySignal {
    pub bot_id: Uuid,
    pub ticker: String,
    pub side: PositionSide,
    pub leverage: u32,
}

/// Request to close a bot's whole position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    pub bot_id: Uuid,
    pub ticker: String,
    pub side: PositionSide,
}

pub struct OrderExecutor {
    pool: DbPool,
    registry: Arc<GatewayRegistry>,
    locks: Arc<dyn LockStore>,
    lock_ttl: Duration,
}

impl OrderExecutor {
    pub fn new(
        pool: DbPool,
        registry: Arc<GatewayRegistry>,
        locks: Arc<dyn LockStore>,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            locks,
            lock_ttl,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Executes the order named by `message`.
    ///
    /// The order is looked up before the lease is taken, so a missing order
    /// never holds a lock.
    pub async fn execute(&self, message: OrderMessage) -> Result<ExecutionOutcome, ExecutionError> {
        let correlation_id = new_correlation_id();
        info!("Executing order {} ({})", message.order_id, correlation_id);

        let mut conn = self.pool.acquire().await?;

        let Some(order) = OrderRepository::get(&mut conn, message.order_id).await? else {
            error!("Order not found for {}", message.order_id);
            let stamp = AuditStamp::new(correlation_id).target(message.order_id);
            record(
                &mut conn,
                &stamp,
                AuditEntry::new(
                    AuditType::OrderNotFound,
                    format!("Order {} not found", message.order_id),
                ),
            )
            .await?;
            return Ok(ExecutionOutcome::Skipped(SkipReason::OrderNotFound));
        };

        let stamp = AuditStamp::new(correlation_id)
            .user(order.user_id)
            .actor(order.bot_id)
            .target(order.id);

        if order.status.is_terminal() {
            info!("Order {} is already {}, skipping", order.id, order.status);
            return Ok(ExecutionOutcome::Skipped(SkipReason::AlreadyTerminal));
        }

        let bot = match self.enabled_bot(&mut conn, order.bot_id, &stamp).await? {
            Ok(bot) => bot,
            Err(reason) => return Ok(ExecutionOutcome::Skipped(reason)),
        };

        let Some(gateway) = self.gateway_for(&mut conn, bot.exchange_id, &stamp).await? else {
            return Ok(ExecutionOutcome::Skipped(SkipReason::ProviderUnavailable));
        };
        drop(conn);

        self.with_bot_lease(&bot, &stamp, || {
            self.run_order(gateway.as_ref(), &bot, &stamp, order.id)
        })
        .await
    }

    /// Opens a position for the bot, or grows it when the bot allows
    /// expansion, and attaches the bot's protective orders.
    pub async fn execute_entry(&self, signal: EntrySignal) -> Result<ExecutionOutcome, ExecutionError> {
        let stamp = AuditStamp::new(new_correlation_id()).actor(signal.bot_id);
        let mut conn = self.pool.acquire().await?;

        let bot = match self.enabled_bot(&mut conn, signal.bot_id, &stamp).await? {
            Ok(bot) => bot,
            Err(reason) => return Ok(ExecutionOutcome::Skipped(reason)),
        };
        let stamp = stamp.user(bot.user_id);

        let Some(gateway) = self.gateway_for(&mut conn, bot.exchange_id, &stamp).await? else {
            return Ok(ExecutionOutcome::Skipped(SkipReason::ProviderUnavailable));
        };
        drop(conn);

        self.with_bot_lease(&bot, &stamp, || {
            self.run_entry(gateway.as_ref(), &bot, &stamp, &signal)
        })
        .await
    }

    /// Closes the bot's whole position on `signal.ticker`
    pub async fn execute_exit(&self, signal: ExitSignal) -> Result<ExecutionOutcome, ExecutionError> {
        let stamp = AuditStamp::new(new_correlation_id()).actor(signal.bot_id);
        let mut conn = self.pool.acquire().await?;

        let bot = match self.enabled_bot(&mut conn, signal.bot_id, &stamp).await? {
            Ok(bot) => bot,
            Err(reason) => return Ok(ExecutionOutcome::Skipped(reason)),
        };
        let stamp = stamp.user(bot.user_id);

        let Some(gateway) = self.gateway_for(&mut conn, bot.exchange_id, &stamp).await? else {
            return Ok(ExecutionOutcome::Skipped(SkipReason::ProviderUnavailable));
        };
        drop(conn);

        self.with_bot_lease(&bot, &stamp, || {
            self.run_exit(gateway.as_ref(), &bot, &stamp, &signal)
        })
        .await
    }

    pub async fn change_margin_type(
        &self,
        exchange_id: Uuid,
        tickers: &[String],
        margin_type: MarginType,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let correlation_id = new_correlation_id();
        let mut conn = self.pool.acquire().await?;

        let Some(exchange) = ExchangeRepository::get(&mut conn, exchange_id).await? else {
            warn!("Exchange {} not found", exchange_id);
            record(
                &mut conn,
                &AuditStamp::new(correlation_id).target(exchange_id),
                AuditEntry::new(
                    AuditType::ProviderNotFound,
                    format!("Exchange {} not found", exchange_id),
                ),
            )
            .await?;
            return Ok(ExecutionOutcome::Skipped(SkipReason::ExchangeNotFound));
        };
        let stamp = AuditStamp::new(correlation_id.clone())
            .user(exchange.user_id)
            .target(exchange.id);

        let gateway = match self.registry.resolve(&exchange) {
            Ok(gateway) => gateway,
            Err(e) => {
                record(&mut conn, &stamp, AuditEntry::new(AuditType::ProviderNotFound, e.to_string()))
                    .await?;
                return Ok(ExecutionOutcome::Skipped(SkipReason::ProviderUnavailable));
            }
        };
        drop(conn);

        let result = gateway
            .change_margin_type(tickers, margin_type, &correlation_id)
            .await;
        if !result.success {
            error!("Margin type change failed on {}: {}", exchange.id, result.message);
        }

        let mut tx = self.pool.begin().await?;
        AuditRepository::insert_all(&mut *tx, &stamp.stamp_all(result.audits)).await?;
        tx.commit().await?;

        Ok(ExecutionOutcome::Executed {
            correlation_id,
            success: result.success,
            ledger: LedgerOutcome::Unchanged,
        })
    }

    async fn run_order(
        &self,
        gateway: &dyn ExchangeGateway,
        bot: &Bot,
        stamp: &AuditStamp,
        order_id: Uuid,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut conn = self.pool.acquire().await?;

        // Re-read under the lease; a concurrent attempt may have settled it.
        let Some(mut order) = OrderRepository::get(&mut conn, order_id).await? else {
            return Ok(ExecutionOutcome::Skipped(SkipReason::OrderNotFound));
        };
        if order.status.is_terminal() {
            return Ok(ExecutionOutcome::Skipped(SkipReason::AlreadyTerminal));
        }

        let position = match order.position_id {
            Some(id) => PositionRepository::get(&mut conn, id).await?,
            None => None,
        };
        let Some(mut position) = position.filter(Position::is_open) else {
            warn!("Order {} has no open position", order.id);
            record(
                &mut conn,
                stamp,
                AuditEntry::new(
                    AuditType::NoOpenPosition,
                    format!("No open position for order {}", order.id),
                ),
            )
            .await?;
            return Ok(ExecutionOutcome::Skipped(SkipReason::NoOpenPosition));
        };
        drop(conn);

        let request = order_request(bot, &order, &position, &stamp.correlation_id);
        let result = gateway.execute(bot, &request).await;
        if !result.success {
            error!("Order execution failed for {}: {}", order.id, result.message);
        }

        let mut tx = self.pool.begin().await?;
        let applied = match order.trigger_type {
            TriggerType::Pyramiding => {
                PositionLedger::scale_position(&mut *tx, bot, &mut position, &result, &mut order)
                    .await
            }
            TriggerType::StopLoss | TriggerType::TakeProfit => {
                PositionLedger::reduce_position(&mut *tx, &mut position, &result, Some(&mut order))
                    .await
            }
        };

        let ledger = self.settle(tx, stamp, result.audits, applied).await?;
        Ok(ExecutionOutcome::Executed {
            correlation_id: result.correlation_id,
            success: result.success,
            ledger,
        })
    }

    async fn run_entry(
        &self,
        gateway: &dyn ExchangeGateway,
        bot: &Bot,
        stamp: &AuditStamp,
        signal: &EntrySignal,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut conn = self.pool.acquire().await?;
        let existing =
            PositionRepository::find_open(&mut conn, bot.exchange_id, &signal.ticker, signal.side)
                .await?;

        if let Some(position) = &existing {
            if !bot.is_position_size_expandable {
                info!(
                    "Bot {} already holds {} position {} on {}",
                    bot.id, signal.side, position.id, signal.ticker
                );
                record(
                    &mut conn,
                    &stamp.clone().target(position.id),
                    AuditEntry::new(
                        AuditType::PositionAlreadyOpen,
                        format!("A {} position is already open on {}", signal.side, signal.ticker),
                    ),
                )
                .await?;
                return Ok(ExecutionOutcome::Skipped(SkipReason::PositionAlreadyOpen));
            }
        }
        drop(conn);

        let request = OrderRequest {
            order_id: None,
            ticker: signal.ticker.clone(),
            leverage: signal.leverage,
            kind: OrderKind::open(signal.side),
            quantity: bot.position_size,
            quantity_type: bot.position_size_type,
            bot_key: bot.key.clone(),
            correlation_id: stamp.correlation_id.clone(),
        };
        let result = gateway.execute(bot, &request).await;
        if !result.success {
            error!("Entry on {} failed for bot {}: {}", signal.ticker, bot.id, result.message);
        }

        let mut tx = self.pool.begin().await?;
        let mut target = existing.as_ref().map(|p| p.id);
        let applied = if !result.success {
            Ok(LedgerOutcome::Unchanged)
        } else if let Some(mut position) = existing {
            PositionLedger::expand_position(&mut *tx, &mut position, &result).await
        } else {
            async {
                let position = PositionLedger::open_position(&mut *tx, bot, &request, &result).await?;
                target = Some(position.id);
                PositionLedger::add_protective_orders(
                    &mut *tx,
                    bot,
                    &position,
                    position.entry_price,
                    None,
                )
                .await?;
                Ok::<_, LedgerError>(LedgerOutcome::Opened)
            }
            .await
        };

        let stamp = match target {
            Some(id) => stamp.clone().target(id),
            None => stamp.clone(),
        };
        let ledger = self.settle(tx, &stamp, result.audits, applied).await?;
        Ok(ExecutionOutcome::Executed {
            correlation_id: result.correlation_id,
            success: result.success,
            ledger,
        })
    }

    async fn run_exit(
        &self,
        gateway: &dyn ExchangeGateway,
        bot: &Bot,
        stamp: &AuditStamp,
        signal: &ExitSignal,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let mut conn = self.pool.acquire().await?;
        let position =
            PositionRepository::find_open(&mut conn, bot.exchange_id, &signal.ticker, signal.side)
                .await?;

        let Some(mut position) = position else {
            record(
                &mut conn,
                stamp,
                AuditEntry::new(
                    AuditType::NoOpenPosition,
                    format!("No open {} position on {}", signal.side, signal.ticker),
                ),
            )
            .await?;
            return Ok(ExecutionOutcome::Skipped(SkipReason::NoOpenPosition));
        };
        drop(conn);

        let stamp = stamp.clone().target(position.id);
        let request = OrderRequest {
            order_id: None,
            ticker: position.symbol.clone(),
            leverage: position.leverage,
            kind: OrderKind::close(position.side),
            quantity: position.current_quantity,
            quantity_type: QuantityType::Exact,
            bot_key: bot.key.clone(),
            correlation_id: stamp.correlation_id.clone(),
        };
        let result = gateway.execute(bot, &request).await;
        if !result.success {
            error!("Exit of position {} failed: {}", position.id, result.message);
        }

        let mut tx = self.pool.begin().await?;
        let applied = PositionLedger::reduce_position(&mut *tx, &mut position, &result, None).await;
        let ledger = self.settle(tx, &stamp, result.audits, applied).await?;
        Ok(ExecutionOutcome::Executed {
            correlation_id: result.correlation_id,
            success: result.success,
            ledger,
        })
    }

    /// Commits the ledger change together with the attempt's audits.
    ///
    /// When the ledger failed the transaction is rolled back, the audits are
    /// written on their own with a `LedgerFailure` entry, and the error is
    /// returned.
    async fn settle(
        &self,
        mut tx: Transaction<'_, Sqlite>,
        stamp: &AuditStamp,
        mut audits: Vec<AuditEntry>,
        applied: Result<LedgerOutcome, LedgerError>,
    ) -> Result<LedgerOutcome, ExecutionError> {
        match applied {
            Ok(outcome) => {
                audits.extend(ledger_audit(outcome));
                AuditRepository::insert_all(&mut *tx, &stamp.stamp_all(audits)).await?;
                tx.commit().await?;
                debug!("Committed {:?} ({})", outcome, stamp.correlation_id);
                Ok(outcome)
            }
            Err(e) => {
                tx.rollback().await?;
                error!("Ledger update failed ({}): {}", stamp.correlation_id, e);

                audits.push(AuditEntry::new(AuditType::LedgerFailure, e.to_string()));
                let mut tx = self.pool.begin().await?;
                AuditRepository::insert_all(&mut *tx, &stamp.stamp_all(audits)).await?;
                tx.commit().await?;
                Err(e.into())
            }
        }
    }

    /// Runs `work` while holding the bot's lease.
    ///
    /// A held lease rejects the attempt with a `LockContention` audit. The
    /// lease is renewed while `work` runs and released however it ends,
    /// including by panic. Should the lease still lapse, the ledger's guarded
    /// writes refuse the later of two settlements.
    async fn with_bot_lease<F, Fut>(
        &self,
        bot: &Bot,
        stamp: &AuditStamp,
        work: F,
    ) -> Result<ExecutionOutcome, ExecutionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExecutionOutcome, ExecutionError>>,
    {
        let key = bot.lock_key();
        let Some(token) = self.locks.try_acquire(&key, self.lock_ttl).await? else {
            warn!("Bot {} is busy, rejecting {}", bot.id, stamp.correlation_id);
            let mut conn = self.pool.acquire().await?;
            record(
                &mut conn,
                stamp,
                AuditEntry::new(
                    AuditType::LockContention,
                    format!("Bot {} has an execution in flight", bot.label),
                ),
            )
            .await?;
            return Ok(ExecutionOutcome::Skipped(SkipReason::Busy));
        };

        let work = AssertUnwindSafe(work()).catch_unwind();
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval(self.renew_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = heartbeat.tick() => self.renew(&token).await,
            }
        };

        match self.locks.release(&token).await {
            Ok(true) => debug!("Released {}", key),
            Ok(false) => warn!("Lease {} expired before release", key),
            Err(e) => error!("Failed to release {}: {}", key, e),
        }

        outcome.unwrap_or_else(|panic| {
            let message = panic_message(panic);
            error!("Execution {} panicked: {}", stamp.correlation_id, message);
            Err(ExecutionError::Panicked(message))
        })
    }

    fn renew_interval(&self) -> Duration {
        (self.lock_ttl / 3).max(MIN_RENEW_INTERVAL)
    }

    async fn renew(&self, token: &LeaseToken) {
        match self.locks.extend(token, self.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => warn!("Lease {} lapsed during execution", token.key),
            Err(e) => warn!("Failed to renew {}: {}", token.key, e),
        }
    }

    /// Loads the bot, auditing when it is missing or disabled
    async fn enabled_bot(
        &self,
        conn: &mut SqliteConnection,
        bot_id: Uuid,
        stamp: &AuditStamp,
    ) -> Result<Result<Bot, SkipReason>, ExecutionError> {
        let Some(bot) = BotRepository::get(conn, bot_id).await? else {
            error!("Bot {} not found", bot_id);
            record(
                conn,
                stamp,
                AuditEntry::new(AuditType::BotNotFound, format!("Bot {} not found", bot_id)),
            )
            .await?;
            return Ok(Err(SkipReason::BotNotFound));
        };

        if !bot.is_enabled {
            info!("Bot {} is disabled", bot.id);
            record(
                conn,
                stamp,
                AuditEntry::new(AuditType::BotDisabled, format!("Bot {} is disabled", bot.label)),
            )
            .await?;
            return Ok(Err(SkipReason::BotDisabled));
        }

        Ok(Ok(bot))
    }

    /// Resolves the exchange's gateway, auditing an unknown or misconfigured
    /// provider
    async fn gateway_for(
        &self,
        conn: &mut SqliteConnection,
        exchange_id: Uuid,
        stamp: &AuditStamp,
    ) -> Result<Option<Arc<dyn ExchangeGateway>>, ExecutionError> {
        let Some(exchange) = ExchangeRepository::get(conn, exchange_id).await? else {
            record(
                conn,
                stamp,
                AuditEntry::new(
                    AuditType::ProviderNotFound,
                    format!("Exchange {} not found", exchange_id),
                ),
            )
            .await?;
            return Ok(None);
        };

        match self.registry.resolve(&exchange) {
            Ok(gateway) => Ok(Some(gateway)),
            Err(e) => {
                record(conn, stamp, AuditEntry::new(AuditType::ProviderNotFound, e.to_string()))
                    .await?;
                Ok(None)
            }
        }
    }
}

async fn record(
    conn: &mut SqliteConnection,
    stamp: &AuditStamp,
    entry: AuditEntry,
) -> Result<(), ExecutionError> {
    AuditRepository::insert(conn, &stamp.stamp(entry)).await?;
    Ok(())
}

/// Gateway request for a trigger order, with its quantity made exact
fn order_request(bot: &Bot, order: &Order, position: &Position, correlation_id: &str) -> OrderRequest {
    let kind = match order.trigger_type {
        TriggerType::Pyramiding => OrderKind::open(position.side),
        TriggerType::StopLoss | TriggerType::TakeProfit => OrderKind::close(position.side),
    };

    OrderRequest {
        order_id: Some(order.id),
        ticker: order.symbol.clone(),
        leverage: position.leverage,
        kind,
        quantity: exact_quantity(order, position),
        quantity_type: QuantityType::Exact,
        bot_key: bot.key.clone(),
        correlation_id: correlation_id.to_string(),
    }
}

fn exact_quantity(order: &Order, position: &Position) -> Decimal {
    if order.close_position && order.trigger_type != TriggerType::Pyramiding {
        return position.current_quantity;
    }
    match order.quantity_type {
        QuantityType::Exact => order.quantity,
        QuantityType::Percentage => position.share_of(order.quantity),
    }
}

fn ledger_audit(outcome: LedgerOutcome) -> Option<AuditEntry> {
    let (kind, description) = match outcome {
        LedgerOutcome::Opened => (AuditType::PositionOpened, "Position opened"),
        LedgerOutcome::Expanded => (AuditType::PositionExpanded, "Position expanded"),
        LedgerOutcome::Closed => (AuditType::PositionClosed, "Position closed"),
        LedgerOutcome::OrderRejected => (AuditType::OrderRejected, "Order rejected"),
        LedgerOutcome::Reduced | LedgerOutcome::Unchanged => return None,
    };
    Some(AuditEntry::new(kind, description))
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
