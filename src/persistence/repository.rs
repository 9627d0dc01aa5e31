//! Database Repository
//!
//! Data access for bots, exchanges, positions, orders and audit records.
//! Every call takes the connection to run on, which is either a pooled
//! connection or the transaction of the current execution attempt.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::models::*;
use super::DatabaseError;
use crate::domain::entities::audit::AuditRecord;
use crate::domain::entities::bot::Bot;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::order::{Order, OrderStatus};
use crate::domain::entities::position::{Position, PositionSide, PositionStatus};

const POSITION_COLUMNS: &str = "id, user_id, bot_id, exchange_id, symbol, side, entry_price, \
     avg_entry_price, quantity, current_quantity, leverage, status, created_at, updated_at";

const ORDER_COLUMNS: &str = "id, user_id, bot_id, exchange_id, position_id, symbol, trigger_type, \
     condition_type, trigger_price, quantity, filled_quantity, quantity_type, close_position, \
     status, related_to, created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, user_id, actor_id, target_id, correlation_id, audit_type, \
     description, data, created_at";

fn query_err(context: &str, e: sqlx::Error) -> DatabaseError {
    error!("{}: {}", context, e);
    DatabaseError::QueryError(format!("{}: {}", context, e))
}

/// Bot repository
pub struct BotRepository;

impl BotRepository {
    pub async fn get(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Bot>, DatabaseError> {
        let record = sqlx::query_as::<_, BotRecord>(
            r#"
            SELECT id, user_id, exchange_id, label, is_enabled, key, position_size,
                   position_size_type, is_position_size_expandable, stop_loss_json,
                   take_profit_json, limit_settings_json
            FROM bots WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to get bot {}", id), e))?;

        record.map(Bot::try_from).transpose()
    }

    pub async fn insert(conn: &mut SqliteConnection, bot: &Bot) -> Result<(), DatabaseError> {
        let stop_loss = bot.stop_loss.as_ref().map(encode_json).transpose()?;
        let limit_settings = bot.limit_settings.as_ref().map(encode_json).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO bots (
                id, user_id, exchange_id, label, is_enabled, key, position_size,
                position_size_type, is_position_size_expandable, stop_loss_json,
                take_profit_json, limit_settings_json
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(bot.id.to_string())
        .bind(bot.user_id.to_string())
        .bind(bot.exchange_id.to_string())
        .bind(&bot.label)
        .bind(bot.is_enabled)
        .bind(&bot.key)
        .bind(bot.position_size.to_string())
        .bind(bot.position_size_type.as_str())
        .bind(bot.is_position_size_expandable)
        .bind(stop_loss)
        .bind(encode_json(&bot.take_profit_targets)?)
        .bind(limit_settings)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to insert bot", e))?;

        debug!("Inserted bot {} ({})", bot.id, bot.label);
        Ok(())
    }
}

/// Exchange repository
pub struct ExchangeRepository;

impl ExchangeRepository {
    pub async fn get(
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<Option<Exchange>, DatabaseError> {
        let record = sqlx::query_as::<_, ExchangeRecord>(
            "SELECT id, user_id, label, provider_key, properties_json FROM exchanges WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to get exchange {}", id), e))?;

        record.map(Exchange::try_from).transpose()
    }

    pub async fn insert(
        conn: &mut SqliteConnection,
        exchange: &Exchange,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO exchanges (id, user_id, label, provider_key, properties_json)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(exchange.id.to_string())
        .bind(exchange.user_id.to_string())
        .bind(&exchange.label)
        .bind(&exchange.provider_key)
        .bind(&exchange.properties)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to insert exchange", e))?;

        debug!("Inserted exchange {} ({})", exchange.id, exchange.provider_key);
        Ok(())
    }
}

/// Position repository
pub struct PositionRepository;

impl PositionRepository {
    pub async fn get(
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<Option<Position>, DatabaseError> {
        let record = sqlx::query_as::<_, PositionRecord>(&format!(
            "SELECT {} FROM positions WHERE id = ?1",
            POSITION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to get position {}", id), e))?;

        record.map(Position::try_from).transpose()
    }

    /// The open position for (exchange, symbol, side), if any
    pub async fn find_open(
        conn: &mut SqliteConnection,
        exchange_id: Uuid,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<Position>, DatabaseError> {
        let record = sqlx::query_as::<_, PositionRecord>(&format!(
            "SELECT {} FROM positions \
             WHERE exchange_id = ?1 AND symbol = ?2 AND side = ?3 AND status = 'open' \
             ORDER BY created_at LIMIT 1",
            POSITION_COLUMNS
        ))
        .bind(exchange_id.to_string())
        .bind(symbol)
        .bind(side.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to find open {} position on {}", side, symbol), e))?;

        record.map(Position::try_from).transpose()
    }

    pub async fn count_open(
        conn: &mut SqliteConnection,
        exchange_id: Uuid,
        symbol: &str,
        side: PositionSide,
    ) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM positions \
             WHERE exchange_id = ?1 AND symbol = ?2 AND side = ?3 AND status = 'open'",
        )
        .bind(exchange_id.to_string())
        .bind(symbol)
        .bind(side.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to count open positions", e))?;

        Ok(count)
    }

    /// Inserts `position` unless an open one already exists for its
    /// (exchange, symbol, side). Lookup and insert are one statement.
    ///
    /// Returns whether the row was inserted.
    pub async fn insert_if_none_open(
        conn: &mut SqliteConnection,
        position: &Position,
    ) -> Result<bool, DatabaseError> {
        let r = PositionRecord::from(position);
        let rows_affected = sqlx::query(
            r#"
            INSERT INTO positions (
                id, user_id, bot_id, exchange_id, symbol, side, entry_price,
                avg_entry_price, quantity, current_quantity, leverage, status,
                created_at, updated_at
            )
            SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
            WHERE NOT EXISTS (
                SELECT 1 FROM positions
                WHERE exchange_id = ?4 AND symbol = ?5 AND side = ?6 AND status = 'open'
            )
            "#,
        )
        .bind(&r.id)
        .bind(&r.user_id)
        .bind(&r.bot_id)
        .bind(&r.exchange_id)
        .bind(&r.symbol)
        .bind(&r.side)
        .bind(&r.entry_price)
        .bind(&r.avg_entry_price)
        .bind(&r.quantity)
        .bind(&r.current_quantity)
        .bind(r.leverage)
        .bind(&r.status)
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to create position", e))?
        .rows_affected();

        if rows_affected > 0 {
            debug!("Created position {} for {} {}", r.id, r.side, r.symbol);
        }
        Ok(rows_affected > 0)
    }

    /// Writes `position` over the row it was read from.
    ///
    /// Only an open row whose current quantity is still `read_quantity` is
    /// updated; returns false when another writer got there first.
    pub async fn update(
        conn: &mut SqliteConnection,
        position: &Position,
        read_quantity: Decimal,
    ) -> Result<bool, DatabaseError> {
        let r = PositionRecord::from(position);
        let rows_affected = sqlx::query(
            r#"
            UPDATE positions
            SET avg_entry_price = ?1, quantity = ?2, current_quantity = ?3,
                status = ?4, updated_at = ?5
            WHERE id = ?6 AND status = ?7 AND current_quantity = ?8
            "#,
        )
        .bind(&r.avg_entry_price)
        .bind(&r.quantity)
        .bind(&r.current_quantity)
        .bind(&r.status)
        .bind(r.updated_at)
        .bind(&r.id)
        .bind(PositionStatus::Open.as_str())
        .bind(read_quantity.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to update position {}", r.id), e))?
        .rows_affected();

        if rows_affected == 0 {
            warn!("Position {} changed since it was read", r.id);
            return Ok(false);
        }

        debug!("Updated position {}", r.id);
        Ok(true)
    }
}

/// Order repository
pub struct OrderRepository;

impl OrderRepository {
    pub async fn get(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Order>, DatabaseError> {
        let record = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {} FROM orders WHERE id = ?1",
            ORDER_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to get order {}", id), e))?;

        record.map(Order::try_from).transpose()
    }

    pub async fn insert(conn: &mut SqliteConnection, order: &Order) -> Result<(), DatabaseError> {
        let r = OrderRecord::from(order);
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, user_id, bot_id, exchange_id, position_id, symbol, trigger_type,
                condition_type, trigger_price, quantity, filled_quantity, quantity_type,
                close_position, status, related_to, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
        )
        .bind(&r.id)
        .bind(&r.user_id)
        .bind(&r.bot_id)
        .bind(&r.exchange_id)
        .bind(&r.position_id)
        .bind(&r.symbol)
        .bind(&r.trigger_type)
        .bind(&r.condition_type)
        .bind(&r.trigger_price)
        .bind(&r.quantity)
        .bind(&r.filled_quantity)
        .bind(&r.quantity_type)
        .bind(r.close_position)
        .bind(&r.status)
        .bind(&r.related_to)
        .bind(r.created_at)
        .bind(r.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to create order", e))?;

        debug!("Created {} order {} for {}", r.trigger_type, r.id, r.symbol);
        Ok(())
    }

    /// Moves an open order to its new state; returns false when the order
    /// already left `Open`
    pub async fn update(conn: &mut SqliteConnection, order: &Order) -> Result<bool, DatabaseError> {
        let r = OrderRecord::from(order);
        let rows_affected = sqlx::query(
            r#"
            UPDATE orders
            SET status = ?1, filled_quantity = ?2, position_id = ?3, updated_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(&r.status)
        .bind(&r.filled_quantity)
        .bind(&r.position_id)
        .bind(r.updated_at)
        .bind(&r.id)
        .bind(OrderStatus::Open.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to update order {}", r.id), e))?
        .rows_affected();

        if rows_affected == 0 {
            warn!("Order {} is no longer open", r.id);
            return Ok(false);
        }

        debug!("Order {} is now {}", r.id, r.status);
        Ok(true)
    }

    /// Cancels every open order of a position, optionally sparing one.
    /// Terminal orders are untouched, so repeating the call changes nothing.
    pub async fn cancel_open_for_position(
        conn: &mut SqliteConnection,
        position_id: Uuid,
        except: Option<Uuid>,
        at: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'cancelled', updated_at = ?1
            WHERE position_id = ?2 AND status = 'open' AND (?3 IS NULL OR id != ?3)
            "#,
        )
        .bind(at)
        .bind(position_id.to_string())
        .bind(except.map(|id| id.to_string()))
        .execute(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to cancel orders of {}", position_id), e))?
        .rows_affected();

        debug!("Cancelled {} open orders of position {}", rows_affected, position_id);
        Ok(rows_affected)
    }

    pub async fn list_for_position(
        conn: &mut SqliteConnection,
        position_id: Uuid,
    ) -> Result<Vec<Order>, DatabaseError> {
        let records = sqlx::query_as::<_, OrderRecord>(&format!(
            "SELECT {} FROM orders WHERE position_id = ?1 ORDER BY created_at, id",
            ORDER_COLUMNS
        ))
        .bind(position_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_err(&format!("Failed to list orders of {}", position_id), e))?;

        records.into_iter().map(Order::try_from).collect()
    }

    /// Open orders whose position is still open
    pub async fn list_armed(conn: &mut SqliteConnection) -> Result<Vec<Order>, DatabaseError> {
        let records = sqlx::query_as::<_, OrderRecord>(
            r#"
            SELECT o.id, o.user_id, o.bot_id, o.exchange_id, o.position_id, o.symbol,
                   o.trigger_type, o.condition_type, o.trigger_price, o.quantity,
                   o.filled_quantity, o.quantity_type, o.close_position, o.status,
                   o.related_to, o.created_at, o.updated_at
            FROM orders o
            JOIN positions p ON p.id = o.position_id
            WHERE o.status = 'open' AND p.status = 'open'
            ORDER BY o.created_at
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to list armed orders", e))?;

        records.into_iter().map(Order::try_from).collect()
    }
}

/// Audit repository
pub struct AuditRepository;

impl AuditRepository {
    pub async fn insert(
        conn: &mut SqliteConnection,
        record: &AuditRecord,
    ) -> Result<(), DatabaseError> {
        let r = AuditLogRecord::from(record);
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, user_id, actor_id, target_id, correlation_id, audit_type,
                description, data, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&r.id)
        .bind(&r.user_id)
        .bind(&r.actor_id)
        .bind(&r.target_id)
        .bind(&r.correlation_id)
        .bind(&r.audit_type)
        .bind(&r.description)
        .bind(&r.data)
        .bind(r.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to insert audit record", e))?;

        Ok(())
    }

    pub async fn insert_all(
        conn: &mut SqliteConnection,
        records: &[AuditRecord],
    ) -> Result<(), DatabaseError> {
        for record in records {
            Self::insert(&mut *conn, record).await?;
        }
        Ok(())
    }

    pub async fn list_by_correlation(
        conn: &mut SqliteConnection,
        correlation_id: &str,
    ) -> Result<Vec<AuditRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, AuditLogRecord>(&format!(
            "SELECT {} FROM audit_log WHERE correlation_id = ?1 ORDER BY created_at, rowid",
            AUDIT_COLUMNS
        ))
        .bind(correlation_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to list audit records", e))?;

        records.into_iter().map(AuditRecord::try_from).collect()
    }

    pub async fn list_by_target(
        conn: &mut SqliteConnection,
        target_id: Uuid,
    ) -> Result<Vec<AuditRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, AuditLogRecord>(&format!(
            "SELECT {} FROM audit_log WHERE target_id = ?1 ORDER BY created_at, rowid",
            AUDIT_COLUMNS
        ))
        .bind(target_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to list audit records", e))?;

        records.into_iter().map(AuditRecord::try_from).collect()
    }

    pub async fn list_by_actor(
        conn: &mut SqliteConnection,
        actor_id: Uuid,
    ) -> Result<Vec<AuditRecord>, DatabaseError> {
        let records = sqlx::query_as::<_, AuditLogRecord>(&format!(
            "SELECT {} FROM audit_log WHERE actor_id = ?1 ORDER BY created_at, rowid",
            AUDIT_COLUMNS
        ))
        .bind(actor_id.to_string())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| query_err("Failed to list audit records", e))?;

        records.into_iter().map(AuditRecord::try_from).collect()
    }
}
