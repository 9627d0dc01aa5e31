pub mod entry_price;
pub mod exchange_info_store;
pub mod position_ledger;
