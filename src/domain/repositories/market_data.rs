use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::entities::order_book::{DepthSnapshot, DepthUpdate};
use crate::domain::errors::MarketDataError;

/// Decoded market stream event
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Ticker { symbol: String, price: Decimal },
    MarkPrice { symbol: String, price: Decimal },
    Depth { symbol: String, update: DepthUpdate },
}

impl FeedEvent {
    pub fn symbol(&self) -> &str {
        match self {
            FeedEvent::Ticker { symbol, .. }
            | FeedEvent::MarkPrice { symbol, .. }
            | FeedEvent::Depth { symbol, .. } => symbol,
        }
    }
}

/// Pull source for order book snapshots
#[async_trait]
pub trait DepthSnapshotSource: Send + Sync {
    async fn fetch_depth(&self, symbol: &str, limit: u32) -> Result<DepthSnapshot, MarketDataError>;
}
