//! Database Models
//!
//! Row shapes for the persisted entities. Identifiers and decimals are kept
//! as text so no precision is lost; conversion to domain types happens here.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use super::DatabaseError;
use crate::domain::entities::audit::AuditRecord;
use crate::domain::entities::bot::Bot;
use crate::domain::entities::exchange::Exchange;
use crate::domain::entities::order::Order;
use crate::domain::entities::position::Position;

/// Bot record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BotRecord {
    pub id: String,
    pub user_id: String,
    pub exchange_id: String,
    pub label: String,
    pub is_enabled: bool,
    pub key: String,
    pub position_size: String,
    pub position_size_type: String, // "exact" or "percentage"
    pub is_position_size_expandable: bool,
    pub stop_loss_json: Option<String>,
    pub take_profit_json: String,
    pub limit_settings_json: Option<String>,
}

/// Exchange record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExchangeRecord {
    pub id: String,
    pub user_id: String,
    pub label: String,
    pub provider_key: String,
    pub properties_json: String,
}

/// Position record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PositionRecord {
    pub id: String,
    pub user_id: String,
    pub bot_id: String,
    pub exchange_id: String,
    pub symbol: String,
    pub side: String, // "long" or "short"
    pub entry_price: String,
    pub avg_entry_price: String,
    pub quantity: String,
    pub current_quantity: String,
    pub leverage: i64,
    pub status: String, // "open" or "closed"
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Order record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderRecord {
    pub id: String,
    pub user_id: String,
    pub bot_id: String,
    pub exchange_id: String,
    pub position_id: Option<String>,
    pub symbol: String,
    pub trigger_type: String,
    pub condition_type: String,
    pub trigger_price: String,
    pub quantity: String,
    pub filled_quantity: String,
    pub quantity_type: String,
    pub close_position: bool,
    pub status: String,
    pub related_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Audit log record in database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditLogRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub correlation_id: String,
    pub audit_type: String,
    pub description: String,
    pub data: Option<String>, // JSON string
    pub created_at: DateTime<Utc>,
}

fn decode_err(field: &str, value: &str, reason: impl std::fmt::Display) -> DatabaseError {
    DatabaseError::DecodeError(format!("{} = {:?}: {}", field, value, reason))
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(value).map_err(|e| decode_err(field, value, e))
}

fn parse_opt_uuid(field: &str, value: Option<&str>) -> Result<Option<Uuid>, DatabaseError> {
    value.map(|v| parse_uuid(field, v)).transpose()
}

fn parse_decimal(field: &str, value: &str) -> Result<Decimal, DatabaseError> {
    Decimal::from_str(value).map_err(|e| decode_err(field, value, e))
}

fn parse_text<T: FromStr<Err = String>>(field: &str, value: &str) -> Result<T, DatabaseError> {
    value.parse().map_err(|e: String| decode_err(field, value, e))
}

fn parse_json<T: DeserializeOwned>(field: &str, value: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(value).map_err(|e| decode_err(field, value, e))
}

pub(crate) fn encode_json<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::QueryError(e.to_string()))
}

impl TryFrom<BotRecord> for Bot {
    type Error = DatabaseError;

    fn try_from(r: BotRecord) -> Result<Self, Self::Error> {
        Ok(Bot {
            id: parse_uuid("bots.id", &r.id)?,
            user_id: parse_uuid("bots.user_id", &r.user_id)?,
            exchange_id: parse_uuid("bots.exchange_id", &r.exchange_id)?,
            label: r.label,
            is_enabled: r.is_enabled,
            key: r.key,
            position_size: parse_decimal("bots.position_size", &r.position_size)?,
            position_size_type: parse_text("bots.position_size_type", &r.position_size_type)?,
            is_position_size_expandable: r.is_position_size_expandable,
            stop_loss: r
                .stop_loss_json
                .as_deref()
                .map(|v| parse_json("bots.stop_loss_json", v))
                .transpose()?,
            take_profit_targets: parse_json("bots.take_profit_json", &r.take_profit_json)?,
            limit_settings: r
                .limit_settings_json
                .as_deref()
                .map(|v| parse_json("bots.limit_settings_json", v))
                .transpose()?,
        })
    }
}

impl TryFrom<ExchangeRecord> for Exchange {
    type Error = DatabaseError;

    fn try_from(r: ExchangeRecord) -> Result<Self, Self::Error> {
        Ok(Exchange {
            id: parse_uuid("exchanges.id", &r.id)?,
            user_id: parse_uuid("exchanges.user_id", &r.user_id)?,
            label: r.label,
            provider_key: r.provider_key,
            properties: r.properties_json,
        })
    }
}

impl TryFrom<PositionRecord> for Position {
    type Error = DatabaseError;

    fn try_from(r: PositionRecord) -> Result<Self, Self::Error> {
        Ok(Position {
            id: parse_uuid("positions.id", &r.id)?,
            user_id: parse_uuid("positions.user_id", &r.user_id)?,
            bot_id: parse_uuid("positions.bot_id", &r.bot_id)?,
            exchange_id: parse_uuid("positions.exchange_id", &r.exchange_id)?,
            symbol: r.symbol,
            side: parse_text("positions.side", &r.side)?,
            entry_price: parse_decimal("positions.entry_price", &r.entry_price)?,
            avg_entry_price: parse_decimal("positions.avg_entry_price", &r.avg_entry_price)?,
            quantity: parse_decimal("positions.quantity", &r.quantity)?,
            current_quantity: parse_decimal("positions.current_quantity", &r.current_quantity)?,
            leverage: u32::try_from(r.leverage)
                .map_err(|e| decode_err("positions.leverage", &r.leverage.to_string(), e))?,
            status: parse_text("positions.status", &r.status)?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

impl From<&Position> for PositionRecord {
    fn from(p: &Position) -> Self {
        PositionRecord {
            id: p.id.to_string(),
            user_id: p.user_id.to_string(),
            bot_id: p.bot_id.to_string(),
            exchange_id: p.exchange_id.to_string(),
            symbol: p.symbol.clone(),
            side: p.side.as_str().to_string(),
            entry_price: p.entry_price.to_string(),
            avg_entry_price: p.avg_entry_price.to_string(),
            quantity: p.quantity.to_string(),
            current_quantity: p.current_quantity.to_string(),
            leverage: i64::from(p.leverage),
            status: p.status.as_str().to_string(),
            created_at: p.created_at,
            updated_at: p.updated_at,
        }
    }
}

impl TryFrom<OrderRecord> for Order {
    type Error = DatabaseError;

    fn try_from(r: OrderRecord) -> Result<Self, Self::Error> {
        Ok(Order {
            id: parse_uuid("orders.id", &r.id)?,
            user_id: parse_uuid("orders.user_id", &r.user_id)?,
            bot_id: parse_uuid("orders.bot_id", &r.bot_id)?,
            exchange_id: parse_uuid("orders.exchange_id", &r.exchange_id)?,
            position_id: parse_opt_uuid("orders.position_id", r.position_id.as_deref())?,
            symbol: r.symbol,
            trigger_type: parse_text("orders.trigger_type", &r.trigger_type)?,
            condition_type: parse_text("orders.condition_type", &r.condition_type)?,
            trigger_price: parse_decimal("orders.trigger_price", &r.trigger_price)?,
            quantity: parse_decimal("orders.quantity", &r.quantity)?,
            filled_quantity: parse_decimal("orders.filled_quantity", &r.filled_quantity)?,
            quantity_type: parse_text("orders.quantity_type", &r.quantity_type)?,
            close_position: r.close_position,
            status: parse_text("orders.status", &r.status)?,
            related_to: parse_opt_uuid("orders.related_to", r.related_to.as_deref())?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

impl From<&Order> for OrderRecord {
    fn from(o: &Order) -> Self {
        OrderRecord {
            id: o.id.to_string(),
            user_id: o.user_id.to_string(),
            bot_id: o.bot_id.to_string(),
            exchange_id: o.exchange_id.to_string(),
            position_id: o.position_id.map(|id| id.to_string()),
            symbol: o.symbol.clone(),
            trigger_type: o.trigger_type.as_str().to_string(),
            condition_type: o.condition_type.as_str().to_string(),
            trigger_price: o.trigger_price.to_string(),
            quantity: o.quantity.to_string(),
            filled_quantity: o.filled_quantity.to_string(),
            quantity_type: o.quantity_type.as_str().to_string(),
            close_position: o.close_position,
            status: o.status.as_str().to_string(),
            related_to: o.related_to.map(|id| id.to_string()),
            created_at: o.created_at,
            updated_at: o.updated_at,
        }
    }
}

impl TryFrom<AuditLogRecord> for AuditRecord {
    type Error = DatabaseError;

    fn try_from(r: AuditLogRecord) -> Result<Self, Self::Error> {
        Ok(AuditRecord {
            id: parse_uuid("audit_log.id", &r.id)?,
            user_id: parse_opt_uuid("audit_log.user_id", r.user_id.as_deref())?,
            actor_id: parse_opt_uuid("audit_log.actor_id", r.actor_id.as_deref())?,
            target_id: parse_opt_uuid("audit_log.target_id", r.target_id.as_deref())?,
            correlation_id: r.correlation_id,
            kind: parse_text("audit_log.audit_type", &r.audit_type)?,
            description: r.description,
            data: r
                .data
                .as_deref()
                .map(|v| parse_json("audit_log.data", v))
                .transpose()?,
            created_at: r.created_at,
        })
    }
}

impl From<&AuditRecord> for AuditLogRecord {
    fn from(a: &AuditRecord) -> Self {
        AuditLogRecord {
            id: a.id.to_string(),
            user_id: a.user_id.map(|id| id.to_string()),
            actor_id: a.actor_id.map(|id| id.to_string()),
            target_id: a.target_id.map(|id| id.to_string()),
            correlation_id: a.correlation_id.clone(),
            audit_type: a.kind.as_str().to_string(),
            description: a.description.clone(),
            data: a.data.as_ref().map(|d| d.to_string()),
            created_at: a.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::order::{ConditionType, OrderStatus};
    use crate::domain::entities::position::PositionSide;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_record_conversion() {
        let position =
            crate::domain::entities::position::tests::sample_position(PositionSide::Short, dec!(1.25));
        let record = PositionRecord::from(&position);
        assert_eq!(record.side, "short");
        assert_eq!(record.current_quantity, "1.25");
        assert_eq!(Position::try_from(record).unwrap(), position);
    }

    #[test]
    fn test_order_record_keeps_never_updated() {
        let order =
            crate::domain::entities::order::tests::sample_order(ConditionType::Decreasing, dec!(95.5));
        let record = OrderRecord::from(&order);
        assert!(record.updated_at.is_none());
        let decoded = Order::try_from(record).unwrap();
        assert_eq!(decoded.status, OrderStatus::Open);
        assert_eq!(decoded, order);
    }

    #[test]
    fn test_corrupt_decimal_is_reported() {
        let position =
            crate::domain::entities::position::tests::sample_position(PositionSide::Long, dec!(1));
        let mut record = PositionRecord::from(&position);
        record.entry_price = "abc".to_string();
        assert!(matches!(
            Position::try_from(record),
            Err(DatabaseError::DecodeError(_))
        ));
    }
}
