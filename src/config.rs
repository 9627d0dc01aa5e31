use std::str::FromStr;
use std::time::Duration;

use crate::application::services::execution_coordinator::DEFAULT_WORKERS;
use crate::persistence::DatabaseConfig;

/// Runtime configuration of the execution engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database: DatabaseConfig,
    pub executor_workers: usize,
    pub execution_lock_ttl: Duration,
    pub order_queue_capacity: usize,
    pub market_key: String, // exchange-info key the paper gateway and monitor read
    pub feed_symbol_limit: usize, // symbols with a depth stream
    pub depth_snapshot_limit: u32,
    pub trigger_scan_interval: Duration,
    pub trigger_cooldown: Duration,
    pub enable_market_feed: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            executor_workers: DEFAULT_WORKERS,
            execution_lock_ttl: Duration::from_secs(30),
            order_queue_capacity: 1024,
            market_key: "binance-usd-futures".to_string(),
            feed_symbol_limit: 30,
            depth_snapshot_limit: 500,
            trigger_scan_interval: Duration::from_millis(1000),
            trigger_cooldown: Duration::from_secs(10),
            enable_market_feed: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`; unset keys keep their default
    /// and invalid values are logged and ignored
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("DATABASE_URL").filter(|u| !u.trim().is_empty()) {
            config.database.url = url;
        }
        if let Some(value) = parse_var(&lookup, "DATABASE_MAX_CONNECTIONS", |v: &u32| *v > 0) {
            config.database.max_connections = value;
        }
        if let Some(value) = parse_var(&lookup, "DATABASE_LOG_QUERIES", |_: &bool| true) {
            config.database.log_queries = value;
        }
        if let Some(value) = parse_var(&lookup, "EXECUTOR_WORKERS", |v: &usize| (1..=64).contains(v)) {
            config.executor_workers = value;
        }
        if let Some(secs) = parse_var(&lookup, "EXECUTION_LOCK_TTL_SECS", |v: &u64| *v > 0) {
            config.execution_lock_ttl = Duration::from_secs(secs);
        }
        if let Some(value) = parse_var(&lookup, "ORDER_QUEUE_CAPACITY", |v: &usize| *v > 0) {
            config.order_queue_capacity = value;
        }
        if let Some(key) = lookup("MARKET_KEY").filter(|k| !k.trim().is_empty()) {
            config.market_key = key;
        }
        if let Some(value) = parse_var(&lookup, "FEED_SYMBOL_LIMIT", |v: &usize| *v <= 200) {
            config.feed_symbol_limit = value;
        }
        // Binance only serves these depth limits
        if let Some(value) = parse_var(&lookup, "DEPTH_SNAPSHOT_LIMIT", |v: &u32| {
            [5, 10, 20, 50, 100, 500, 1000].contains(v)
        }) {
            config.depth_snapshot_limit = value;
        }
        if let Some(ms) = parse_var(&lookup, "TRIGGER_SCAN_INTERVAL_MS", |v: &u64| *v >= 100) {
            config.trigger_scan_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var(&lookup, "TRIGGER_COOLDOWN_SECS", |_: &u64| true) {
            config.trigger_cooldown = Duration::from_secs(secs);
        }
        if let Some(enabled) = lookup("ENABLE_MARKET_FEED") {
            config.enable_market_feed = enabled.to_lowercase() == "true" || enabled == "1";
        }

        config
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    valid: impl Fn(&T) -> bool,
) -> Option<T>
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        Ok(value) => {
            tracing::warn!("Invalid {} value: {}, using default", key, value);
            None
        }
        Err(e) => {
            tracing::warn!("Failed to parse {} '{}': {}, using default", key, raw, e);
            None
        }
    }
}
