pub mod binance_market;
pub mod channel_queue;
pub mod gateway_registry;
pub mod memory_lock_store;
pub mod paper_gateway;
pub mod provider_config;
