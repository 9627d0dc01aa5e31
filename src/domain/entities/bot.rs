use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::entities::order::QuantityType;

/// How the entry price is derived from the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryComputation {
    Statistical,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitSettings {
    pub computation: EntryComputation,
    pub order_book_depth: usize,
    /// Formula source handed to the entry evaluator for `Custom`
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopLossSettings {
    pub price_percent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub activation_percent: Decimal,
    pub share_percent: Decimal,
}

/// Snapshot of a bot's configuration, read once per execution
#[derive(Debug, Clone, PartialEq)]
pub struct Bot {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange_id: Uuid,
    pub label: String,
    pub is_enabled: bool,
    pub key: String,
    pub position_size: Decimal,
    pub position_size_type: QuantityType,
    pub is_position_size_expandable: bool,
    pub stop_loss: Option<StopLossSettings>,
    pub take_profit_targets: Vec<TakeProfitTarget>,
    pub limit_settings: Option<LimitSettings>,
}

impl Bot {
    /// Key of the execution lease serializing this bot's orders
    pub fn lock_key(&self) -> String {
        format!("bot-lock:{}", self.id)
    }
}
