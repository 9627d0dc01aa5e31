//! Position Ledger
//!
//! Applies execution results to orders and positions.
//!
//! Positions move `Open -> Closed`; orders move from `Open` to exactly one of
//! `Filled`, `Cancelled` or `Rejected`. Every operation runs on the caller's
//! connection, which during execution is the attempt's transaction, so a
//! failing step leaves nothing behind once the caller rolls back.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::entities::bot::Bot;
use crate::domain::entities::order::{ConditionType, Order, OrderStatus, QuantityType, TriggerType};
use crate::domain::entities::position::{Position, PositionSide, PositionStatus};
use crate::domain::errors::LedgerError;
use crate::domain::repositories::exchange_gateway::{ExecutionResult, OrderRequest};
use crate::persistence::repository::{OrderRepository, PositionRepository};

/// Parameters of an order attached to a position
#[derive(Debug, Clone, PartialEq)]
pub struct OrderDraft {
    pub trigger_type: TriggerType,
    pub condition_type: ConditionType,
    pub trigger_price: Decimal,
    pub quantity: Decimal,
    pub quantity_type: QuantityType,
    pub close_position: bool,
    pub related_to: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Opened,
    Expanded,
    Reduced,
    Closed,
    OrderRejected,
    Unchanged,
}

pub struct PositionLedger;

impl PositionLedger {
    /// Creates the position filled by `result`, unless one is already open
    /// for the same (exchange, symbol, side).
    pub async fn open_position(
        conn: &mut SqliteConnection,
        bot: &Bot,
        request: &OrderRequest,
        result: &ExecutionResult,
    ) -> Result<Position, LedgerError> {
        let (price, quantity) = fill_of(result)?;
        let now = Utc::now();
        let side = request.kind.position_side();

        let position = Position {
            id: Uuid::new_v4(),
            user_id: bot.user_id,
            bot_id: bot.id,
            exchange_id: bot.exchange_id,
            symbol: request.ticker.clone(),
            side,
            entry_price: price,
            avg_entry_price: price,
            quantity,
            current_quantity: quantity,
            leverage: request.leverage,
            status: PositionStatus::Open,
            created_at: now,
            updated_at: now,
        };

        if !PositionRepository::insert_if_none_open(conn, &position).await? {
            warn!(
                "Refusing to open a second {} position on {} for exchange {}",
                side, request.ticker, bot.exchange_id
            );
            return Err(LedgerError::PositionAlreadyOpen {
                exchange_id: bot.exchange_id,
                symbol: request.ticker.clone(),
                side,
            });
        }

        info!(
            "Opened {} position {} on {}: {} @ {}",
            side, position.id, position.symbol, quantity, price
        );
        Ok(position)
    }

    /// Adds a pyramiding fill to an open position
    pub async fn expand_position(
        conn: &mut SqliteConnection,
        position: &mut Position,
        result: &ExecutionResult,
    ) -> Result<LedgerOutcome, LedgerError> {
        let (price, quantity) = fill_of(result)?;
        let read_quantity = position.current_quantity;
        position.expand(price, quantity, Utc::now())?;
        save_position(conn, position, read_quantity).await?;

        info!(
            "Expanded position {} by {} @ {} (average entry {})",
            position.id, quantity, price, position.avg_entry_price
        );
        Ok(LedgerOutcome::Expanded)
    }

    pub async fn add_order(
        conn: &mut SqliteConnection,
        position: &Position,
        draft: OrderDraft,
    ) -> Result<Order, LedgerError> {
        let order = Order {
            id: Uuid::new_v4(),
            user_id: position.user_id,
            bot_id: position.bot_id,
            exchange_id: position.exchange_id,
            position_id: Some(position.id),
            symbol: position.symbol.clone(),
            trigger_type: draft.trigger_type,
            condition_type: draft.condition_type,
            trigger_price: draft.trigger_price,
            quantity: draft.quantity,
            filled_quantity: Decimal::ZERO,
            quantity_type: draft.quantity_type,
            close_position: draft.close_position,
            status: OrderStatus::Open,
            related_to: draft.related_to,
            created_at: Utc::now(),
            updated_at: None,
        };

        OrderRepository::insert(conn, &order).await?;
        Ok(order)
    }

    /// Creates the bot's stop-loss and take-profit orders around `base_price`.
    ///
    /// Orders spawned by a pyramiding fill (`related_to` set) only get the
    /// take-profit ladder; the original stop loss keeps covering the position.
    pub async fn add_protective_orders(
        conn: &mut SqliteConnection,
        bot: &Bot,
        position: &Position,
        base_price: Decimal,
        related_to: Option<Uuid>,
    ) -> Result<Vec<Order>, LedgerError> {
        let mut drafts = Vec::new();

        if related_to.is_none() {
            if let Some(stop_loss) = &bot.stop_loss {
                drafts.push(OrderDraft {
                    trigger_type: TriggerType::StopLoss,
                    condition_type: adverse_condition(position.side),
                    trigger_price: offset_price(base_price, position.side, -stop_loss.price_percent),
                    quantity: Decimal::ONE_HUNDRED,
                    quantity_type: QuantityType::Percentage,
                    close_position: true,
                    related_to: None,
                });
            }
        }

        let total_share: Decimal = bot.take_profit_targets.iter().map(|t| t.share_percent).sum();
        let last = bot.take_profit_targets.len().saturating_sub(1);
        for (index, target) in bot.take_profit_targets.iter().enumerate() {
            drafts.push(OrderDraft {
                trigger_type: TriggerType::TakeProfit,
                condition_type: favorable_condition(position.side),
                trigger_price: offset_price(base_price, position.side, target.activation_percent),
                quantity: target.share_percent,
                quantity_type: QuantityType::Percentage,
                close_position: index == last && total_share >= Decimal::ONE_HUNDRED,
                related_to,
            });
        }

        let mut orders = Vec::with_capacity(drafts.len());
        for draft in drafts {
            orders.push(Self::add_order(conn, position, draft).await?);
        }

        debug!("Added {} protective orders to position {}", orders.len(), position.id);
        Ok(orders)
    }

    /// Applies a pyramiding order's execution: fill and expand on success,
    /// reject otherwise.
    pub async fn scale_position(
        conn: &mut SqliteConnection,
        bot: &Bot,
        position: &mut Position,
        result: &ExecutionResult,
        order: &mut Order,
    ) -> Result<LedgerOutcome, LedgerError> {
        let now = Utc::now();
        if !result.success {
            order.reject(now)?;
            save_order(conn, order).await?;
            return Ok(LedgerOutcome::OrderRejected);
        }

        let (price, quantity) = fill_of(result)?;
        order.fill(quantity, now)?;
        save_order(conn, order).await?;
        Self::expand_position(conn, position, result).await?;
        Self::add_protective_orders(conn, bot, position, price, Some(order.id)).await?;
        Ok(LedgerOutcome::Expanded)
    }

    /// Applies a closing execution to `position`.
    ///
    /// - order present, execution failed: the order is rejected, nothing else
    /// - no order: open orders are cancelled and the position closed
    /// - closing order: remaining orders cancelled, position closed, then the
    ///   order is filled and the fill deducted
    /// - otherwise: the order is filled and the fill deducted; reaching zero
    ///   closes the position
    pub async fn reduce_position(
        conn: &mut SqliteConnection,
        position: &mut Position,
        result: &ExecutionResult,
        order: Option<&mut Order>,
    ) -> Result<LedgerOutcome, LedgerError> {
        let now = Utc::now();
        let read_quantity = position.current_quantity;

        let Some(order) = order else {
            if !result.success {
                return Ok(LedgerOutcome::Unchanged);
            }
            ensure_open(position)?;
            Self::close(conn, position, None, now).await?;
            save_position(conn, position, read_quantity).await?;
            return Ok(LedgerOutcome::Closed);
        };

        if !result.success {
            order.reject(now)?;
            save_order(conn, order).await?;
            info!("Order {} rejected: {}", order.id, result.message);
            return Ok(LedgerOutcome::OrderRejected);
        }

        ensure_open(position)?;
        let filled = result
            .fill_quantity
            .ok_or(LedgerError::MissingFill("fill quantity"))?;

        if order.close_position {
            Self::close(conn, position, Some(order.id), now).await?;
            order.fill(filled, now)?;
            position.reduce(filled, now)?;
            save_order(conn, order).await?;
            save_position(conn, position, read_quantity).await?;
            return Ok(LedgerOutcome::Closed);
        }

        order.fill(filled, now)?;
        position.reduce(filled, now)?;
        save_order(conn, order).await?;

        if position.current_quantity.is_zero() {
            Self::close(conn, position, Some(order.id), now).await?;
            save_position(conn, position, read_quantity).await?;
            return Ok(LedgerOutcome::Closed);
        }

        save_position(conn, position, read_quantity).await?;
        debug!(
            "Position {} reduced by {} to {}",
            position.id, filled, position.current_quantity
        );
        Ok(LedgerOutcome::Reduced)
    }

    /// Cancels every open order of the position; repeated calls are no-ops
    pub async fn cancel_open_orders(
        conn: &mut SqliteConnection,
        position: &Position,
    ) -> Result<u64, LedgerError> {
        let cancelled =
            OrderRepository::cancel_open_for_position(conn, position.id, None, Utc::now()).await?;
        Ok(cancelled)
    }

    async fn close(
        conn: &mut SqliteConnection,
        position: &mut Position,
        spare: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        OrderRepository::cancel_open_for_position(conn, position.id, spare, at).await?;
        position.close(at);
        info!("Closed position {} on {}", position.id, position.symbol);
        Ok(())
    }
}

async fn save_order(conn: &mut SqliteConnection, order: &Order) -> Result<(), LedgerError> {
    if !OrderRepository::update(conn, order).await? {
        return Err(LedgerError::Conflict {
            entity: "Order",
            id: order.id,
        });
    }
    Ok(())
}

/// Persists `position` if nobody changed it since it held `read_quantity`
async fn save_position(
    conn: &mut SqliteConnection,
    position: &Position,
    read_quantity: Decimal,
) -> Result<(), LedgerError> {
    if !PositionRepository::update(conn, position, read_quantity).await? {
        return Err(LedgerError::Conflict {
            entity: "Position",
            id: position.id,
        });
    }
    Ok(())
}

fn ensure_open(position: &Position) -> Result<(), LedgerError> {
    if position.is_open() {
        Ok(())
    } else {
        Err(LedgerError::PositionClosed(position.id))
    }
}

fn fill_of(result: &ExecutionResult) -> Result<(Decimal, Decimal), LedgerError> {
    let price = result
        .entry_price
        .ok_or(LedgerError::MissingFill("entry price"))?;
    let quantity = result
        .fill_quantity
        .ok_or(LedgerError::MissingFill("fill quantity"))?;
    Ok((price, quantity))
}

/// Price moving `percent` in the position's favor (negative: against it)
fn offset_price(base: Decimal, side: PositionSide, percent: Decimal) -> Decimal {
    let factor = match side {
        PositionSide::Long => Decimal::ONE + percent / Decimal::ONE_HUNDRED,
        PositionSide::Short => Decimal::ONE - percent / Decimal::ONE_HUNDRED,
    };
    (base * factor).normalize()
}

fn adverse_condition(side: PositionSide) -> ConditionType {
    match side {
        PositionSide::Long => ConditionType::Decreasing,
        PositionSide::Short => ConditionType::Increasing,
    }
}

fn favorable_condition(side: PositionSide) -> ConditionType {
    match side {
        PositionSide::Long => ConditionType::Increasing,
        PositionSide::Short => ConditionType::Decreasing,
    }
}
