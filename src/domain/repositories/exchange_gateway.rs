//! Exchange Gateway Trait
//!
//! Normalized execution contract every exchange provider implements. A
//! gateway never returns an error for a failed trade: failures are reported
//! in-band through `ExecutionResult::success` together with the audit
//! entries describing what happened.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::entities::audit::{AuditEntry, AuditType};
use crate::domain::entities::bot::Bot;
use crate::domain::entities::exchange::MarginType;
use crate::domain::entities::order::QuantityType;
use crate::domain::entities::position::PositionSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderKind {
    OpenLong,
    OpenShort,
    CloseLong,
    CloseShort,
}

impl OrderKind {
    pub fn open(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => OrderKind::OpenLong,
            PositionSide::Short => OrderKind::OpenShort,
        }
    }

    pub fn close(side: PositionSide) -> Self {
        match side {
            PositionSide::Long => OrderKind::CloseLong,
            PositionSide::Short => OrderKind::CloseShort,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OrderKind::OpenLong | OrderKind::OpenShort)
    }

    /// Side of the position this order opens or closes
    pub fn position_side(&self) -> PositionSide {
        match self {
            OrderKind::OpenLong | OrderKind::CloseLong => PositionSide::Long,
            OrderKind::OpenShort | OrderKind::CloseShort => PositionSide::Short,
        }
    }

    /// Book side the order takes liquidity from, expressed as the entry side
    /// (buying reads asks like a long entry, selling reads bids like a short)
    pub fn taker_side(&self) -> PositionSide {
        match self {
            OrderKind::OpenLong | OrderKind::CloseShort => PositionSide::Long,
            OrderKind::OpenShort | OrderKind::CloseLong => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::OpenLong => write!(f, "open-long"),
            OrderKind::OpenShort => write!(f, "open-short"),
            OrderKind::CloseLong => write!(f, "close-long"),
            OrderKind::CloseShort => write!(f, "close-short"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: Option<Uuid>,
    pub ticker: String,
    pub leverage: u32,
    pub kind: OrderKind,
    pub quantity: Decimal,
    pub quantity_type: QuantityType,
    pub bot_key: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub message: String,
    pub correlation_id: String,
    pub entry_price: Option<Decimal>,
    pub fill_quantity: Option<Decimal>,
    pub client_order_id: Option<String>,
    pub audits: Vec<AuditEntry>,
}

impl ExecutionResult {
    pub fn filled(
        correlation_id: &str,
        entry_price: Decimal,
        fill_quantity: Decimal,
        client_order_id: String,
        audits: Vec<AuditEntry>,
    ) -> Self {
        Self {
            success: true,
            message: format!("Filled {} at {}", fill_quantity, entry_price),
            correlation_id: correlation_id.to_string(),
            entry_price: Some(entry_price),
            fill_quantity: Some(fill_quantity),
            client_order_id: Some(client_order_id),
            audits,
        }
    }

    /// Failed result; appends an `ExecutionFailed` audit carrying `message`
    pub fn failed(correlation_id: &str, message: impl Into<String>, mut audits: Vec<AuditEntry>) -> Self {
        let message = message.into();
        audits.push(AuditEntry::new(AuditType::ExecutionFailed, message.clone()));
        Self {
            success: false,
            message,
            correlation_id: correlation_id.to_string(),
            entry_price: None,
            fill_quantity: None,
            client_order_id: None,
            audits,
        }
    }
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Registry key of the provider
    fn provider_key(&self) -> &str;

    async fn execute(&self, bot: &Bot, request: &OrderRequest) -> ExecutionResult;

    async fn change_margin_type(
        &self,
        tickers: &[String],
        margin_type: MarginType,
        correlation_id: &str,
    ) -> ExecutionResult;
}
