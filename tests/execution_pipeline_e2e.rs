use async_trait::async_trait;
use chrono::Utc;
use meteor::application::services::execution_coordinator::ExecutionCoordinator;
use meteor::application::services::order_executor::{
    EntrySignal, ExecutionOutcome, OrderExecutor,
};
use meteor::application::services::trigger_monitor::TriggerMonitor;
use meteor::domain::entities::audit::AuditType;
use meteor::domain::entities::bot::{
    Bot, EntryComputation, LimitSettings, StopLossSettings, TakeProfitTarget,
};
use meteor::domain::entities::exchange::{Exchange, MarginType};
use meteor::domain::entities::order::{
    ConditionType, Order, OrderStatus, QuantityType, TriggerType,
};
use meteor::domain::entities::order_book::DepthSnapshot;
use meteor::domain::entities::position::{Position, PositionSide, PositionStatus};
use meteor::domain::repositories::exchange_gateway::{
    ExchangeGateway, ExecutionResult, OrderRequest,
};
use meteor::domain::repositories::lock_store::LockStore;
use meteor::domain::repositories::order_queue::{OrderMessage, OrderQueue};
use meteor::domain::services::entry_price::EntryPriceCalculator;
use meteor::domain::services::exchange_info_store::{ExchangeInfoStore, PriceTicker, SymbolInfo};
use meteor::infrastructure::channel_queue::ChannelOrderQueue;
use meteor::infrastructure::gateway_registry::GatewayRegistry;
use meteor::infrastructure::memory_lock_store::MemoryLockStore;
use meteor::infrastructure::paper_gateway::PaperAccounts;
use meteor::infrastructure::provider_config::{PropertyKind, PropertySpec, ProviderConfig};
use meteor::persistence::repository::{
    AuditRepository, BotRepository, ExchangeRepository, OrderRepository, PositionRepository,
};
use meteor::persistence::{init_database, DatabaseConfig, DbPool};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const MARKET: &str = "binance-usd-futures";

fn exchange(provider_key: &str, properties: &str) -> Exchange {
    Exchange {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        label: "primary".to_string(),
        provider_key: provider_key.to_string(),
        properties: properties.to_string(),
    }
}

fn bot(exchange: &Exchange, limit_settings: Option<LimitSettings>) -> Bot {
    Bot {
        id: Uuid::new_v4(),
        user_id: exchange.user_id,
        exchange_id: exchange.id,
        label: "e2e-bot".to_string(),
        is_enabled: true,
        key: "bot-key".to_string(),
        position_size: dec!(2),
        position_size_type: QuantityType::Exact,
        is_position_size_expandable: false,
        stop_loss: Some(StopLossSettings {
            price_percent: dec!(5),
        }),
        take_profit_targets: vec![TakeProfitTarget {
            activation_percent: dec!(10),
            share_percent: dec!(100),
        }],
        limit_settings,
    }
}

fn position(bot: &Bot) -> Position {
    let now = Utc::now();
    Position {
        id: Uuid::new_v4(),
        user_id: bot.user_id,
        bot_id: bot.id,
        exchange_id: bot.exchange_id,
        symbol: "BTCUSDT".to_string(),
        side: PositionSide::Long,
        entry_price: dec!(100),
        avg_entry_price: dec!(100),
        quantity: dec!(2),
        current_quantity: dec!(2),
        leverage: 5,
        status: PositionStatus::Open,
        created_at: now,
        updated_at: now,
    }
}

fn order(position: &Position, trigger_type: TriggerType, quantity: Decimal, close_position: bool) -> Order {
    Order {
        id: Uuid::new_v4(),
        user_id: position.user_id,
        bot_id: position.bot_id,
        exchange_id: position.exchange_id,
        position_id: Some(position.id),
        symbol: position.symbol.clone(),
        trigger_type,
        condition_type: ConditionType::Immediate,
        trigger_price: dec!(100),
        quantity,
        filled_quantity: Decimal::ZERO,
        quantity_type: QuantityType::Exact,
        close_position,
        status: OrderStatus::Open,
        related_to: None,
        created_at: Utc::now(),
        updated_at: None,
    }
}

async fn seed(pool: &DbPool, exchange: &Exchange, bot: &Bot, position: &Position, orders: &[&Order]) {
    let mut conn = pool.acquire().await.unwrap();
    ExchangeRepository::insert(&mut conn, exchange).await.unwrap();
    BotRepository::insert(&mut conn, bot).await.unwrap();
    assert!(PositionRepository::insert_if_none_open(&mut conn, position)
        .await
        .unwrap());
    for order in orders {
        OrderRepository::insert(&mut conn, order).await.unwrap();
    }
}

async fn wait_for_status(pool: &DbPool, id: Uuid, status: OrderStatus) {
    for _ in 0..300 {
        if order_status(pool, id).await == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("order {} never reached {}", id, status);
}

async fn wait_for_audit(pool: &DbPool, target: Uuid, kind: AuditType) {
    for _ in 0..300 {
        if audit_kinds(pool, target).await.contains(&kind) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no {} audit for {}", kind, target);
}

async fn order_status(pool: &DbPool, id: Uuid) -> OrderStatus {
    let mut conn = pool.acquire().await.unwrap();
    OrderRepository::get(&mut conn, id).await.unwrap().unwrap().status
}

async fn audit_kinds(pool: &DbPool, target: Uuid) -> Vec<AuditType> {
    let mut conn = pool.acquire().await.unwrap();
    AuditRepository::list_by_target(&mut conn, target)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.kind)
        .collect()
}

async fn market_with_book() -> Arc<ExchangeInfoStore> {
    let store = Arc::new(ExchangeInfoStore::new());
    let symbol = SymbolInfo::new("BTCUSDT", 1, 3).with_prices(PriceTicker {
        last_price: Some(dec!(100)),
        mark_price: Some(dec!(100)),
    });
    symbol.order_book().write().await.load_snapshot(DepthSnapshot {
        last_update_id: 1,
        asks: vec![(dec!(100), dec!(1)), (dec!(101), dec!(2)), (dec!(102), dec!(5))],
        bids: vec![(dec!(99), dec!(1)), (dec!(98), dec!(1)), (dec!(97), dec!(1))],
    });
    store.upsert_market(MARKET, vec![symbol]).await;
    store
}

#[tokio::test]
async fn test_entry_then_stop_loss_through_the_worker_pool() {
    let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
    let store = market_with_book().await;
    let registry = Arc::new(GatewayRegistry::with_builtin(
        store.clone(),
        Arc::new(EntryPriceCalculator::new()),
        Arc::new(PaperAccounts::new()),
    ));

    let exchange = exchange("paper", r#"[{"property": "market", "value": "binance-usd-futures"}]"#);
    let bot = bot(
        &exchange,
        Some(LimitSettings {
            computation: EntryComputation::Statistical,
            order_book_depth: 3,
            code: None,
        }),
    );
    let mut conn = pool.acquire().await.unwrap();
    ExchangeRepository::insert(&mut conn, &exchange).await.unwrap();
    BotRepository::insert(&mut conn, &bot).await.unwrap();
    drop(conn);

    let executor = Arc::new(OrderExecutor::new(
        pool.clone(),
        registry,
        Arc::new(MemoryLockStore::new()),
        Duration::from_secs(30),
    ));

    // Statistical entry over asks {100, 101, 102} resolves to 102
    let outcome = executor
        .execute_entry(EntrySignal {
            bot_id: bot.id,
            ticker: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            leverage: 5,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Executed { success: true, .. }));

    let mut conn = pool.acquire().await.unwrap();
    let opened = PositionRepository::find_open(&mut conn, exchange.id, "BTCUSDT", PositionSide::Long)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(opened.entry_price, dec!(102));
    assert_eq!(opened.quantity, dec!(2));
    let orders = OrderRepository::list_for_position(&mut conn, opened.id).await.unwrap();
    drop(conn);
    let stop = orders
        .iter()
        .find(|o| o.trigger_type == TriggerType::StopLoss)
        .unwrap()
        .clone();
    assert_eq!(stop.trigger_price, dec!(96.9));

    let queue = Arc::new(ChannelOrderQueue::new(16));
    let coordinator =
        ExecutionCoordinator::new(executor.clone(), queue.clone() as Arc<dyn OrderQueue>, 3).start();
    let mut monitor = TriggerMonitor::new(
        pool.clone(),
        store.clone(),
        MARKET,
        queue.clone(),
        Duration::from_millis(100),
        Duration::from_secs(60),
    );

    // Nothing armed is triggered at the opening price
    assert_eq!(monitor.scan().await.unwrap(), 0);

    let symbol = store.symbol(MARKET, "BTCUSDT").await.unwrap();
    symbol.set_mark_price(dec!(96)).await;
    assert_eq!(monitor.scan().await.unwrap(), 1);

    wait_for_status(&pool, stop.id, OrderStatus::Filled).await;

    let mut conn = pool.acquire().await.unwrap();
    let closed = PositionRepository::get(&mut conn, opened.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.current_quantity, Decimal::ZERO);
    let remaining = OrderRepository::list_for_position(&mut conn, opened.id).await.unwrap();
    drop(conn);
    assert!(remaining
        .iter()
        .filter(|o| o.id != stop.id)
        .all(|o| o.status == OrderStatus::Cancelled));

    let kinds = audit_kinds(&pool, stop.id).await;
    assert!(kinds.contains(&AuditType::OrderRequested));
    assert!(kinds.contains(&AuditType::OrderFilled));
    assert!(kinds.contains(&AuditType::PositionClosed));

    queue.close();
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_failed_closing_order_is_rejected_and_position_stays_open() {
    let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();

    // Symbol is listed but has no price yet, so the paper fill fails
    let store = Arc::new(ExchangeInfoStore::new());
    store
        .upsert_market(MARKET, vec![SymbolInfo::new("BTCUSDT", 1, 3)])
        .await;
    let registry = Arc::new(GatewayRegistry::with_builtin(
        store,
        Arc::new(EntryPriceCalculator::new()),
        Arc::new(PaperAccounts::new()),
    ));

    let exchange = exchange("paper", r#"[{"property": "paper_balance", "value": "5000"}]"#);
    let bot = bot(&exchange, None);
    let position = position(&bot);
    let closing = order(&position, TriggerType::StopLoss, dec!(2), true);
    let sibling = order(&position, TriggerType::TakeProfit, dec!(1), false);
    seed(&pool, &exchange, &bot, &position, &[&closing, &sibling]).await;

    let executor = OrderExecutor::new(
        pool.clone(),
        registry,
        Arc::new(MemoryLockStore::new()),
        Duration::from_secs(30),
    );
    let outcome = executor
        .execute(OrderMessage {
            order_id: closing.id,
        })
        .await
        .unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Executed { success: false, .. }));

    assert_eq!(order_status(&pool, closing.id).await, OrderStatus::Rejected);
    assert_eq!(order_status(&pool, sibling.id).await, OrderStatus::Open);

    let mut conn = pool.acquire().await.unwrap();
    let still_open = PositionRepository::get(&mut conn, position.id).await.unwrap().unwrap();
    assert_eq!(still_open.status, PositionStatus::Open);
    assert_eq!(still_open.current_quantity, dec!(2));
    drop(conn);

    let kinds = audit_kinds(&pool, closing.id).await;
    assert!(kinds.contains(&AuditType::ExecutionFailed));
    assert!(kinds.contains(&AuditType::OrderRejected));
}

#[derive(Debug, Deserialize)]
struct HeldConfig {
    #[allow(dead_code)]
    venue: String,
}

impl ProviderConfig for HeldConfig {
    const PROPERTIES: &'static [PropertySpec] = &[PropertySpec {
        name: "venue",
        display_name: "Venue",
        kind: PropertyKind::Text,
        required: true,
        encrypted: false,
        default: None,
    }];
}

/// Holds every execution until released
#[derive(Default)]
struct HeldGateway {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl ExchangeGateway for HeldGateway {
    fn provider_key(&self) -> &str {
        "held"
    }

    async fn execute(&self, _bot: &Bot, request: &OrderRequest) -> ExecutionResult {
        self.entered.notify_one();
        self.release.notified().await;
        ExecutionResult::filled(
            &request.correlation_id,
            dec!(100),
            request.quantity,
            "held-1".to_string(),
            Vec::new(),
        )
    }

    async fn change_margin_type(
        &self,
        _tickers: &[String],
        _margin_type: MarginType,
        correlation_id: &str,
    ) -> ExecutionResult {
        ExecutionResult::failed(correlation_id, "unsupported", Vec::new())
    }
}

#[tokio::test]
async fn test_second_execution_for_a_busy_bot_is_rejected() {
    let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
    let gateway = Arc::new(HeldGateway::default());

    let mut registry = GatewayRegistry::new();
    let registered = gateway.clone();
    registry.register::<HeldConfig, _>("held", move |_, _| {
        registered.clone() as Arc<dyn ExchangeGateway>
    });

    let exchange = exchange("held", r#"[{"property": "venue", "value": "test"}]"#);
    let bot = bot(&exchange, None);
    let position = position(&bot);
    let first = order(&position, TriggerType::TakeProfit, dec!(0.5), false);
    let second = order(&position, TriggerType::TakeProfit, dec!(0.5), false);
    seed(&pool, &exchange, &bot, &position, &[&first, &second]).await;

    let locks = Arc::new(MemoryLockStore::new());
    let executor = Arc::new(OrderExecutor::new(
        pool.clone(),
        Arc::new(registry),
        locks.clone(),
        Duration::from_secs(30),
    ));
    let queue = Arc::new(ChannelOrderQueue::new(16));
    let coordinator =
        ExecutionCoordinator::new(executor, queue.clone() as Arc<dyn OrderQueue>, 2).start();

    queue.publish(OrderMessage { order_id: first.id }).await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), gateway.entered.notified())
        .await
        .expect("first execution should reach the gateway");

    queue.publish(OrderMessage { order_id: second.id }).await.unwrap();
    wait_for_audit(&pool, second.id, AuditType::LockContention).await;
    assert_eq!(order_status(&pool, second.id).await, OrderStatus::Open);

    gateway.release.notify_one();
    wait_for_status(&pool, first.id, OrderStatus::Filled).await;

    let mut conn = pool.acquire().await.unwrap();
    let reduced = PositionRepository::get(&mut conn, position.id).await.unwrap().unwrap();
    assert_eq!(reduced.current_quantity, dec!(1.5));
    drop(conn);
    assert!(!locks.is_locked(&bot.lock_key()).await.unwrap());

    queue.close();
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_margin_type_change_applies_to_later_paper_fills() {
    let pool = init_database(&DatabaseConfig::in_memory()).await.unwrap();
    let accounts = Arc::new(PaperAccounts::new());
    let registry = Arc::new(GatewayRegistry::with_builtin(
        market_with_book().await,
        Arc::new(EntryPriceCalculator::new()),
        accounts.clone(),
    ));

    let exchange = exchange("paper", r#"[{"property": "market", "value": "binance-usd-futures"}]"#);
    let bot = bot(&exchange, None);
    let mut conn = pool.acquire().await.unwrap();
    ExchangeRepository::insert(&mut conn, &exchange).await.unwrap();
    BotRepository::insert(&mut conn, &bot).await.unwrap();
    drop(conn);

    let executor = OrderExecutor::new(
        pool.clone(),
        registry,
        Arc::new(MemoryLockStore::new()),
        Duration::from_secs(30),
    );

    let changed = executor
        .change_margin_type(exchange.id, &["BTCUSDT".to_string()], MarginType::Isolated)
        .await
        .unwrap();
    assert!(matches!(changed, ExecutionOutcome::Executed { success: true, .. }));
    assert_eq!(
        accounts.margin_type(exchange.id, "BTCUSDT").await,
        Some(MarginType::Isolated)
    );

    // The entry resolves a fresh gateway for the same exchange
    let outcome = executor
        .execute_entry(EntrySignal {
            bot_id: bot.id,
            ticker: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            leverage: 2,
        })
        .await
        .unwrap();
    let ExecutionOutcome::Executed {
        correlation_id,
        success: true,
        ..
    } = outcome
    else {
        panic!("entry should fill, got {:?}", outcome);
    };

    let mut conn = pool.acquire().await.unwrap();
    let audits = AuditRepository::list_by_correlation(&mut conn, &correlation_id)
        .await
        .unwrap();
    let fill = audits
        .iter()
        .find(|a| a.kind == AuditType::OrderFilled)
        .expect("fill audit");
    assert_eq!(fill.data.as_ref().unwrap()["margin_type"], "isolated");
}
