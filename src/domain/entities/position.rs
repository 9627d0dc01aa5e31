use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::entities::order::string_enum;
use crate::domain::errors::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

string_enum!(PositionSide {
    Long => "long",
    Short => "short",
});

string_enum!(PositionStatus {
    Open => "open",
    Closed => "closed",
});

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: Uuid,
    pub exchange_id: Uuid,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub avg_entry_price: Decimal,
    pub quantity: Decimal,
    pub current_quantity: Decimal,
    pub leverage: u32,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Reduces the current quantity. Never clamps: an oversized reduce is an error.
    pub fn reduce(&mut self, quantity: Decimal, at: DateTime<Utc>) -> Result<(), LedgerError> {
        if quantity.is_sign_negative() || quantity > self.current_quantity {
            return Err(LedgerError::QuantityUnderflow {
                position_id: self.id,
                current: self.current_quantity,
                requested: quantity,
            });
        }
        self.current_quantity -= quantity;
        self.updated_at = at;
        Ok(())
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        self.status = PositionStatus::Closed;
        self.updated_at = at;
    }

    /// Adds a pyramiding fill and re-weights the average entry price
    pub fn expand(
        &mut self,
        price: Decimal,
        quantity: Decimal,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if !self.is_open() {
            return Err(LedgerError::PositionClosed(self.id));
        }
        let total = self.current_quantity + quantity;
        if !total.is_zero() {
            self.avg_entry_price =
                (self.avg_entry_price * self.current_quantity + price * quantity) / total;
        }
        self.quantity += quantity;
        self.current_quantity = total;
        self.updated_at = at;
        Ok(())
    }

    /// Percentage of the original quantity, capped at what is still held
    pub fn share_of(&self, percent: Decimal) -> Decimal {
        (self.quantity * percent / Decimal::ONE_HUNDRED).min(self.current_quantity)
    }
}
