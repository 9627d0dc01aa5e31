//! Paper trading gateway
//!
//! Simulates fills against the live market data held in the
//! [`ExchangeInfoStore`]. Bots with limit settings are priced from the order
//! book through the [`EntryPriceCalculator`]; others fill at the mark price.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::entities::audit::{AuditEntry, AuditType};
use crate::domain::entities::bot::Bot;
use crate::domain::entities::exchange::MarginType;
use crate::domain::entities::order::QuantityType;
use crate::domain::errors::ConfigError;
use crate::domain::repositories::exchange_gateway::{
    ExchangeGateway, ExecutionResult, OrderKind, OrderRequest,
};
use crate::domain::services::entry_price::EntryPriceCalculator;
use crate::domain::services::exchange_info_store::{ExchangeInfoStore, SymbolInfo};
use crate::infrastructure::provider_config::{PropertyKind, PropertySpec, ProviderConfig};

pub const PAPER_PROVIDER_KEY: &str = "paper";

const DEFAULT_MARKET: &str = "binance-usd-futures";

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_market")]
    pub market: String,
    #[serde(default = "default_balance")]
    pub paper_balance: Decimal,
    #[serde(default = "default_use_order_book")]
    pub use_order_book: bool,
}

fn default_market() -> String {
    DEFAULT_MARKET.to_string()
}

fn default_balance() -> Decimal {
    Decimal::from(10_000)
}

fn default_use_order_book() -> bool {
    true
}

impl ProviderConfig for PaperConfig {
    const PROPERTIES: &'static [PropertySpec] = &[
        PropertySpec {
            name: "market",
            display_name: "Market data source",
            kind: PropertyKind::Text,
            required: false,
            encrypted: false,
            default: Some(DEFAULT_MARKET),
        },
        PropertySpec {
            name: "paper_balance",
            display_name: "Paper balance",
            kind: PropertyKind::Decimal,
            required: false,
            encrypted: false,
            default: Some("10000"),
        },
        PropertySpec {
            name: "use_order_book",
            display_name: "Price limit entries from the order book",
            kind: PropertyKind::Boolean,
            required: false,
            encrypted: false,
            default: Some("true"),
        },
    ];

    fn validate(&self) -> Result<(), ConfigError> {
        if self.paper_balance <= Decimal::ZERO {
            return Err(ConfigError::InvalidProperty {
                name: "paper_balance".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Simulated account settings of every paper exchange, keyed by exchange id
#[derive(Debug, Default)]
pub struct PaperAccounts {
    margin_types: Mutex<HashMap<(Uuid, String), MarginType>>,
}

impl PaperAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn margin_type(&self, exchange_id: Uuid, ticker: &str) -> Option<MarginType> {
        self.margin_types
            .lock()
            .await
            .get(&(exchange_id, ticker.to_string()))
            .copied()
    }

    async fn set_margin_type(&self, exchange_id: Uuid, ticker: &str, margin_type: MarginType) {
        self.margin_types
            .lock()
            .await
            .insert((exchange_id, ticker.to_string()), margin_type);
    }
}

pub struct PaperGateway {
    exchange_id: Uuid,
    config: PaperConfig,
    store: Arc<ExchangeInfoStore>,
    calculator: Arc<EntryPriceCalculator>,
    accounts: Arc<PaperAccounts>,
}

impl PaperGateway {
    pub fn new(
        exchange_id: Uuid,
        config: PaperConfig,
        store: Arc<ExchangeInfoStore>,
        calculator: Arc<EntryPriceCalculator>,
        accounts: Arc<PaperAccounts>,
    ) -> Self {
        Self {
            exchange_id,
            config,
            store,
            calculator,
            accounts,
        }
    }

    pub fn config(&self) -> &PaperConfig {
        &self.config
    }

    /// Margin type fills on `ticker` use; cross until changed
    pub async fn margin_type(&self, ticker: &str) -> MarginType {
        self.accounts
            .margin_type(self.exchange_id, ticker)
            .await
            .unwrap_or(MarginType::Cross)
    }

    async fn fill_price(
        &self,
        bot: &Bot,
        symbol: &SymbolInfo,
        kind: OrderKind,
    ) -> Result<Decimal, String> {
        if self.config.use_order_book {
            if let Some(settings) = &bot.limit_settings {
                let book = symbol.order_book().read().await;
                return self
                    .calculator
                    .resolve(&book, kind.taker_side(), settings)
                    .map_err(|e| e.to_string());
            }
        }

        symbol
            .prices()
            .await
            .reference_price()
            .filter(|p| p.is_sign_positive() && !p.is_zero())
            .ok_or_else(|| format!("No price available for {}", symbol.name()))
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn provider_key(&self) -> &str {
        PAPER_PROVIDER_KEY
    }

    async fn execute(&self, bot: &Bot, request: &OrderRequest) -> ExecutionResult {
        let cid = request.correlation_id.as_str();
        let mut audits = vec![AuditEntry::new(
            AuditType::OrderRequested,
            format!(
                "{} {} {} ({}) x{}",
                request.kind, request.quantity, request.ticker, request.quantity_type, request.leverage
            ),
        )
        .with_data(json!(request))];

        if request.bot_key != bot.key {
            warn!("Rejecting order for bot {}: key mismatch", bot.id);
            return ExecutionResult::failed(cid, "Bot key does not match", audits);
        }

        let Some(symbol) = self.store.symbol(&self.config.market, &request.ticker).await else {
            return ExecutionResult::failed(
                cid,
                format!("Symbol {} not found on {}", request.ticker, self.config.market),
                audits,
            );
        };

        let price = match self.fill_price(bot, &symbol, request.kind).await {
            Ok(price) => price,
            Err(message) => return ExecutionResult::failed(cid, message, audits),
        };

        let quantity = match request.quantity_type {
            QuantityType::Exact => request.quantity,
            QuantityType::Percentage if request.kind.is_open() => {
                self.config.paper_balance * request.quantity / Decimal::ONE_HUNDRED
                    * Decimal::from(request.leverage.max(1))
                    / price
            }
            QuantityType::Percentage => {
                return ExecutionResult::failed(
                    cid,
                    "Closing orders need an exact quantity",
                    audits,
                )
            }
        };

        let quantity = symbol.round_quantity(quantity);
        if quantity <= Decimal::ZERO {
            return ExecutionResult::failed(
                cid,
                format!("Quantity rounds to zero for {}", request.ticker),
                audits,
            );
        }
        let price = symbol.round_price(price);
        let margin_type = self.margin_type(&request.ticker).await;

        audits.push(
            AuditEntry::new(
                AuditType::OrderFilled,
                format!(
                    "{} {} {} @ {} ({})",
                    request.kind, quantity, request.ticker, price, margin_type
                ),
            )
            .with_data(json!({
                "price": price,
                "quantity": quantity,
                "margin_type": margin_type,
            })),
        );

        info!(
            "Paper fill {} {} {} @ {} {} ({})",
            request.kind, quantity, request.ticker, price, margin_type, cid
        );

        ExecutionResult::filled(
            cid,
            price,
            quantity,
            format!("paper-{}", Uuid::new_v4().simple()),
            audits,
        )
    }

    async fn change_margin_type(
        &self,
        tickers: &[String],
        margin_type: MarginType,
        correlation_id: &str,
    ) -> ExecutionResult {
        let mut audits = Vec::with_capacity(tickers.len());
        for ticker in tickers {
            self.accounts
                .set_margin_type(self.exchange_id, ticker, margin_type)
                .await;
            audits.push(AuditEntry::new(
                AuditType::MarginTypeChanged,
                format!("{} margin set to {}", ticker, margin_type),
            ));
        }
        info!(
            "Exchange {} margin type {} on {} symbols",
            self.exchange_id,
            margin_type,
            tickers.len()
        );

        ExecutionResult {
            success: true,
            message: format!("Margin type {} applied to {} symbols", margin_type, tickers.len()),
            correlation_id: correlation_id.to_string(),
            entry_price: None,
            fill_quantity: None,
            client_order_id: None,
            audits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::bot::{EntryComputation, LimitSettings};
    use crate::domain::entities::order_book::DepthSnapshot;
    use crate::domain::services::exchange_info_store::PriceTicker;
    use crate::infrastructure::provider_config::decode_config;
    use rust_decimal_macros::dec;

    fn bot(limit_settings: Option<LimitSettings>) -> Bot {
        Bot {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            exchange_id: Uuid::new_v4(),
            label: "paper-bot".to_string(),
            is_enabled: true,
            key: "secret".to_string(),
            position_size: dec!(1),
            position_size_type: QuantityType::Exact,
            is_position_size_expandable: false,
            stop_loss: None,
            take_profit_targets: vec![],
            limit_settings,
        }
    }

    fn request(kind: OrderKind, quantity: Decimal, quantity_type: QuantityType) -> OrderRequest {
        OrderRequest {
            order_id: None,
            ticker: "BTCUSDT".to_string(),
            leverage: 2,
            kind,
            quantity,
            quantity_type,
            bot_key: "secret".to_string(),
            correlation_id: "cid123".to_string(),
        }
    }

    async fn gateway() -> PaperGateway {
        let store = Arc::new(ExchangeInfoStore::new());
        let symbol = SymbolInfo::new("BTCUSDT", 1, 3).with_prices(PriceTicker {
            last_price: Some(dec!(99)),
            mark_price: Some(dec!(100)),
        });
        symbol.order_book().write().await.load_snapshot(DepthSnapshot {
            last_update_id: 1,
            asks: vec![(dec!(100), dec!(1)), (dec!(101), dec!(2)), (dec!(102), dec!(5))],
            bids: vec![(dec!(99), dec!(1)), (dec!(98), dec!(1))],
        });
        store.upsert_market(DEFAULT_MARKET, vec![symbol]).await;

        let config: PaperConfig =
            decode_config(r#"[{"property": "paper_balance", "value": "1000"}]"#).unwrap();
        PaperGateway::new(
            Uuid::new_v4(),
            config,
            store,
            Arc::new(EntryPriceCalculator::new()),
            Arc::new(PaperAccounts::new()),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config: PaperConfig =
            decode_config(r#"[{"property": "use_order_book", "value": false}]"#).unwrap();
        assert_eq!(config.market, DEFAULT_MARKET);
        assert_eq!(config.paper_balance, dec!(10000));
        assert!(!config.use_order_book);
    }

    #[tokio::test]
    async fn test_exact_fill_at_mark_price() {
        let gateway = gateway().await;
        let result = gateway
            .execute(&bot(None), &request(OrderKind::OpenLong, dec!(0.5), QuantityType::Exact))
            .await;

        assert!(result.success, "{}", result.message);
        assert_eq!(result.correlation_id, "cid123");
        assert_eq!(result.entry_price, Some(dec!(100)));
        assert_eq!(result.fill_quantity, Some(dec!(0.5)));
        assert!(result.client_order_id.unwrap().starts_with("paper-"));
        assert_eq!(result.audits.len(), 2);
        assert_eq!(result.audits[1].kind, AuditType::OrderFilled);
    }

    #[tokio::test]
    async fn test_limit_entry_uses_order_book() {
        let gateway = gateway().await;
        let settings = LimitSettings {
            computation: EntryComputation::Statistical,
            order_book_depth: 3,
            code: None,
        };
        let result = gateway
            .execute(
                &bot(Some(settings)),
                &request(OrderKind::OpenLong, dec!(1), QuantityType::Exact),
            )
            .await;
        assert_eq!(result.entry_price, Some(dec!(102)));
    }

    #[tokio::test]
    async fn test_percentage_open_uses_balance_and_leverage() {
        let gateway = gateway().await;
        let result = gateway
            .execute(
                &bot(None),
                &request(OrderKind::OpenShort, dec!(10), QuantityType::Percentage),
            )
            .await;
        // 1000 * 10% * 2 / 100
        assert_eq!(result.fill_quantity, Some(dec!(2)));
    }

    #[tokio::test]
    async fn test_failures_are_reported_in_band() {
        let gateway = gateway().await;

        let mut wrong_key = request(OrderKind::OpenLong, dec!(1), QuantityType::Exact);
        wrong_key.bot_key = "nope".to_string();
        let result = gateway.execute(&bot(None), &wrong_key).await;
        assert!(!result.success);
        assert_eq!(result.audits.last().unwrap().kind, AuditType::ExecutionFailed);

        let mut unknown = request(OrderKind::OpenLong, dec!(1), QuantityType::Exact);
        unknown.ticker = "DOGEUSDT".to_string();
        assert!(!gateway.execute(&bot(None), &unknown).await.success);

        let closing = request(OrderKind::CloseLong, dec!(50), QuantityType::Percentage);
        assert!(!gateway.execute(&bot(None), &closing).await.success);

        let tiny = request(OrderKind::OpenLong, dec!(0.0001), QuantityType::Exact);
        assert!(!gateway.execute(&bot(None), &tiny).await.success);
    }

    #[tokio::test]
    async fn test_change_margin_type() {
        let gateway = gateway().await;
        let tickers = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let result = gateway
            .change_margin_type(&tickers, MarginType::Isolated, "cid")
            .await;
        assert!(result.success);
        assert_eq!(result.audits.len(), 2);
        assert_eq!(gateway.margin_type("ETHUSDT").await, MarginType::Isolated);
        assert_eq!(gateway.margin_type("SOLUSDT").await, MarginType::Cross);

        let fill = gateway
            .execute(&bot(None), &request(OrderKind::OpenLong, dec!(1), QuantityType::Exact))
            .await;
        let data = fill.audits[1].data.as_ref().unwrap();
        assert_eq!(data["margin_type"], "isolated");
    }
}
