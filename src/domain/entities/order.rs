use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::LedgerError;

/// What caused an order to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    StopLoss,
    TakeProfit,
    Pyramiding,
}

/// How the trigger price is compared against the market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Immediate,
    Decreasing,
    Increasing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityType {
    Exact,
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(format!("Unknown {} value: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

pub(crate) use string_enum;

string_enum!(TriggerType {
    StopLoss => "stop_loss",
    TakeProfit => "take_profit",
    Pyramiding => "pyramiding",
});

string_enum!(ConditionType {
    Immediate => "immediate",
    Decreasing => "decreasing",
    Increasing => "increasing",
});

string_enum!(QuantityType {
    Exact => "exact",
    Percentage => "percentage",
});

string_enum!(OrderStatus {
    Open => "open",
    Filled => "filled",
    Cancelled => "cancelled",
    Rejected => "rejected",
});

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Open)
    }
}

/// A conditional order attached to a position.
///
/// `updated_at` stays `None` until the order leaves `Open`, so a stored order
/// always tells whether it has ever transitioned.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub exchange_id: Uuid,
    pub position_id: Option<Uuid>,
    pub symbol: String,
    pub trigger_type: TriggerType,
    pub condition_type: ConditionType,
    pub trigger_price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub quantity_type: QuantityType,
    pub close_position: bool,
    pub status: OrderStatus,
    pub related_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    /// Whether `price` satisfies the trigger condition
    pub fn is_triggered(&self, price: Decimal) -> bool {
        match self.condition_type {
            ConditionType::Immediate => true,
            ConditionType::Decreasing => price <= self.trigger_price,
            ConditionType::Increasing => price >= self.trigger_price,
        }
    }

    pub fn fill(&mut self, quantity: Decimal, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.terminate(OrderStatus::Filled, at)?;
        self.filled_quantity = quantity;
        Ok(())
    }

    pub fn reject(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.terminate(OrderStatus::Rejected, at)
    }

    /// Cancelling a terminal order is a no-op; returns whether anything changed.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = OrderStatus::Cancelled;
        self.updated_at = Some(at);
        true
    }

    fn terminate(&mut self, status: OrderStatus, at: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.status.is_terminal() {
            return Err(LedgerError::OrderTerminal {
                order_id: self.id,
                status: self.status,
            });
        }
        self.status = status;
        self.updated_at = Some(at);
        Ok(())
    }
}
