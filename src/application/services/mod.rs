pub mod execution_coordinator;
pub mod market_feed;
pub mod order_executor;
pub mod trigger_monitor;
