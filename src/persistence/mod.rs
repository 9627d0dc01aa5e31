//! Persistence Layer
//!
//! SQLite storage for bots, exchanges, positions, orders and the audit log,
//! with async access via sqlx.
//!
//! Repositories take a `&mut SqliteConnection` so that the same calls run on
//! a pooled connection or inside the transaction of one execution attempt.
//!
//! # Database Schema
//!
//! ## Positions Table
//! - id: UUID
//! - exchange_id / symbol / side: at most one open row per tuple, enforced
//!   by the ledger, not by an index
//! - entry_price, avg_entry_price, quantity, current_quantity: decimal text
//! - status: "open" or "closed"
//!
//! ## Orders Table
//! - position_id: nullable
//! - status: "open", "filled", "cancelled", "rejected"
//! - updated_at: NULL until the first transition
//!
//! ## Audit Log Table
//! - correlation_id: shared by every record of one execution attempt
//! - user_id / actor_id / target_id: nullable stamps
//! - data: optional JSON

pub mod models;
pub mod repository;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Corrupt row: {0}")]
    DecodeError(String),
}

/// Initialize the database connection pool
///
/// In-memory URLs get a single, never-recycled connection so every caller
/// sees the same database.
///
/// # Errors
/// Returns error if database connection fails or migrations fail
pub async fn init_database(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", config.url);

    let in_memory = config.url.contains(":memory:");

    // Ensure data directory exists
    if !in_memory {
        if let Some(db_path) = config.url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(db_path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let level = if config.log_queries {
        tracing::log::LevelFilter::Debug
    } else {
        tracing::log::LevelFilter::Off
    };
    let options = SqliteConnectOptions::from_str(&config.url)?
        .create_if_missing(true)
        .log_statements(level);

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections)
    };

    let pool = pool_options.connect_with(options).await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");

    Ok(pool)
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    let tables: [(&str, &str); 5] = [
        (
            "bots",
            r#"
            CREATE TABLE IF NOT EXISTS bots (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                label TEXT NOT NULL,
                is_enabled BOOLEAN NOT NULL DEFAULT 1,
                key TEXT NOT NULL,
                position_size TEXT NOT NULL,
                position_size_type TEXT NOT NULL CHECK(position_size_type IN ('exact', 'percentage')),
                is_position_size_expandable BOOLEAN NOT NULL DEFAULT 0,
                stop_loss_json TEXT,
                take_profit_json TEXT NOT NULL DEFAULT '[]',
                limit_settings_json TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        ),
        (
            "exchanges",
            r#"
            CREATE TABLE IF NOT EXISTS exchanges (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                label TEXT NOT NULL,
                provider_key TEXT NOT NULL,
                properties_json TEXT NOT NULL,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        ),
        (
            "positions",
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL CHECK(side IN ('long', 'short')),
                entry_price TEXT NOT NULL,
                avg_entry_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                current_quantity TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                status TEXT NOT NULL CHECK(status IN ('open', 'closed')),
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
        ),
        (
            "orders",
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                exchange_id TEXT NOT NULL,
                position_id TEXT,
                symbol TEXT NOT NULL,
                trigger_type TEXT NOT NULL CHECK(trigger_type IN ('stop_loss', 'take_profit', 'pyramiding')),
                condition_type TEXT NOT NULL CHECK(condition_type IN ('immediate', 'decreasing', 'increasing')),
                trigger_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                filled_quantity TEXT NOT NULL,
                quantity_type TEXT NOT NULL CHECK(quantity_type IN ('exact', 'percentage')),
                close_position BOOLEAN NOT NULL DEFAULT 0,
                status TEXT NOT NULL CHECK(status IN ('open', 'filled', 'cancelled', 'rejected')),
                related_to TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME
            )
            "#,
        ),
        (
            "audit_log",
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                actor_id TEXT,
                target_id TEXT,
                correlation_id TEXT NOT NULL,
                audit_type TEXT NOT NULL,
                description TEXT NOT NULL,
                data TEXT,
                created_at DATETIME NOT NULL
            )
            "#,
        ),
    ];

    for (table, ddl) in tables {
        sqlx::query(ddl).execute(pool).await.map_err(|e| {
            DatabaseError::MigrationError(format!("Failed to create {} table: {}", table, e))
        })?;
    }

    // Create indexes for better query performance
    let indexes = [
        "CREATE INDEX IF NOT EXISTS idx_positions_open ON positions(exchange_id, symbol, side, status)",
        "CREATE INDEX IF NOT EXISTS idx_orders_position_status ON orders(position_id, status)",
        "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status)",
        "CREATE INDEX IF NOT EXISTS idx_audit_correlation ON audit_log(correlation_id)",
        "CREATE INDEX IF NOT EXISTS idx_audit_target ON audit_log(target_id)",
    ];

    for ddl in indexes {
        sqlx::query(ddl)
            .execute(pool)
            .await
            .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;
    }

    info!("✓ Database migrations completed successfully");

    Ok(())
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/meteor.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/meteor.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            log_queries: false,
        }
    }
}
