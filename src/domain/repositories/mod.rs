pub mod entry_evaluator;
pub mod exchange_gateway;
pub mod lock_store;
pub mod market_data;
pub mod order_queue;
