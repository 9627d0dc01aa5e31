//! Exchange Info Store
//!
//! Shared cache of per-market symbol metadata, prices and order books.
//! Constructed once at startup and handed to the market feed (writer) and
//! the gateways (readers) as an `Arc`.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::domain::entities::order_book::OrderBook;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PriceTicker {
    pub last_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

impl PriceTicker {
    /// Mark price, falling back to the last trade
    pub fn reference_price(&self) -> Option<Decimal> {
        self.mark_price.or(self.last_price)
    }
}

#[derive(Debug)]
pub struct SymbolInfo {
    name: String,
    price_precision: u32,
    quantity_precision: u32,
    prices: RwLock<PriceTicker>,
    order_book: RwLock<OrderBook>,
}

impl SymbolInfo {
    pub fn new(name: impl Into<String>, price_precision: u32, quantity_precision: u32) -> Self {
        let name = name.into();
        Self {
            order_book: RwLock::new(OrderBook::new(name.clone())),
            name,
            price_precision,
            quantity_precision,
            prices: RwLock::new(PriceTicker::default()),
        }
    }

    pub fn with_prices(mut self, ticker: PriceTicker) -> Self {
        self.prices = RwLock::new(ticker);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn price_precision(&self) -> u32 {
        self.price_precision
    }

    pub fn quantity_precision(&self) -> u32 {
        self.quantity_precision
    }

    pub async fn prices(&self) -> PriceTicker {
        *self.prices.read().await
    }

    pub async fn set_last_price(&self, price: Decimal) {
        self.prices.write().await.last_price = Some(price);
    }

    pub async fn set_mark_price(&self, price: Decimal) {
        self.prices.write().await.mark_price = Some(price);
    }

    pub fn order_book(&self) -> &RwLock<OrderBook> {
        &self.order_book
    }

    pub fn round_price(&self, price: Decimal) -> Decimal {
        price.round_dp_with_strategy(self.price_precision, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Quantities round toward zero so a fill never exceeds what was asked
    pub fn round_quantity(&self, quantity: Decimal) -> Decimal {
        quantity.round_dp_with_strategy(self.quantity_precision, RoundingStrategy::ToZero)
    }
}

#[derive(Debug)]
pub struct ExchangeInfo {
    pub name: String,
    pub modified_at: DateTime<Utc>,
    symbols: HashMap<String, Arc<SymbolInfo>>,
}

impl ExchangeInfo {
    pub fn symbol(&self, name: &str) -> Option<Arc<SymbolInfo>> {
        self.symbols.get(name).cloned()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Arc<SymbolInfo>> {
        self.symbols.values()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ExchangeInfoStore {
    markets: RwLock<HashMap<String, Arc<ExchangeInfo>>>,
}

impl ExchangeInfoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the symbol set of `market`
    pub async fn upsert_market(
        &self,
        market: &str,
        symbols: impl IntoIterator<Item = SymbolInfo>,
    ) -> Arc<ExchangeInfo> {
        let symbols: HashMap<String, Arc<SymbolInfo>> = symbols
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect();

        let info = Arc::new(ExchangeInfo {
            name: market.to_string(),
            modified_at: Utc::now(),
            symbols,
        });

        info!("Exchange info for {} holds {} symbols", market, info.len());
        self.markets
            .write()
            .await
            .insert(market.to_string(), info.clone());
        info
    }

    pub async fn market(&self, market: &str) -> Option<Arc<ExchangeInfo>> {
        self.markets.read().await.get(market).cloned()
    }

    pub async fn symbol(&self, market: &str, symbol: &str) -> Option<Arc<SymbolInfo>> {
        self.markets.read().await.get(market)?.symbol(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_store_lookup_and_price_updates() {
        let store = ExchangeInfoStore::new();
        store
            .upsert_market(
                "binance-usd-futures",
                vec![SymbolInfo::new("BTCUSDT", 1, 3), SymbolInfo::new("ETHUSDT", 2, 3)],
            )
            .await;

        assert!(store.symbol("binance-usd-futures", "SOLUSDT").await.is_none());
        assert!(store.symbol("other", "BTCUSDT").await.is_none());

        let btc = store
            .symbol("binance-usd-futures", "BTCUSDT")
            .await
            .unwrap();
        assert_eq!(btc.prices().await.reference_price(), None);

        btc.set_last_price(dec!(100)).await;
        assert_eq!(btc.prices().await.reference_price(), Some(dec!(100)));
        btc.set_mark_price(dec!(101)).await;
        assert_eq!(btc.prices().await.reference_price(), Some(dec!(101)));
    }

    #[test]
    fn test_rounding_to_precision() {
        let symbol = SymbolInfo::new("BTCUSDT", 1, 3);
        assert_eq!(symbol.round_price(dec!(102.65)), dec!(102.7));
        assert_eq!(symbol.round_quantity(dec!(0.12399)), dec!(0.123));
    }
}
