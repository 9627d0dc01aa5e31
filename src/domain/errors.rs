use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entities::order::OrderStatus;
use crate::domain::entities::position::PositionSide;
use crate::persistence::DatabaseError;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EntryPriceError {
    #[error("Order book for {symbol} has no {side} levels")]
    EmptyBook { symbol: String, side: &'static str },

    #[error("Limit settings request a custom formula but none was provided")]
    MissingFormula,

    #[error("No entry evaluator registered for custom formulas")]
    EvaluatorUnavailable,

    #[error("Entry evaluator failed: {0}")]
    EvaluatorFailed(String),

    #[error("Entry price computation produced a non-finite value")]
    NonFinite,

    #[error("No entry point found in {symbol} for target price {target}")]
    NoEntryPoint { symbol: String, target: Decimal },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("A {side} position on {symbol} is already open for exchange {exchange_id}")]
    PositionAlreadyOpen {
        exchange_id: Uuid,
        symbol: String,
        side: PositionSide,
    },

    #[error("Position {0} is closed")]
    PositionClosed(Uuid),

    #[error("Reducing position {position_id} by {requested} exceeds its current quantity {current}")]
    QuantityUnderflow {
        position_id: Uuid,
        current: Decimal,
        requested: Decimal,
    },

    #[error("Order {order_id} is already {status}")]
    OrderTerminal { order_id: Uuid, status: OrderStatus },

    #[error("Execution result is missing {0}")]
    MissingFill(&'static str),

    #[error("{entity} {id} was changed by a concurrent execution")]
    Conflict { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("There is no property to bind this provider.")]
    NoProperties,

    #[error("Malformed property bag: {0}")]
    Malformed(String),

    #[error("Missing required property: {0}")]
    MissingProperty(String),

    #[error("Invalid value for property {name}: {reason}")]
    InvalidProperty { name: String, reason: String },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Exchanger type {0} not found")]
    UnknownProvider(String),

    #[error("Invalid configuration for exchange {exchange}: {source}")]
    Config {
        exchange: String,
        #[source]
        source: ConfigError,
    },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LockError {
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    #[error("Order queue is closed")]
    Closed,

    #[error("Failed to publish order message: {0}")]
    Publish(String),
}

#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<serde_json::Error> for MarketDataError {
    fn from(e: serde_json::Error) -> Self {
        MarketDataError::Parse(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Execution panicked: {0}")]
    Panicked(String),
}

impl From<sqlx::Error> for ExecutionError {
    fn from(e: sqlx::Error) -> Self {
        ExecutionError::Database(DatabaseError::ConnectionError(e))
    }
}
