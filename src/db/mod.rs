//! SQLite persistence for the purchase ledger.
//!
//! The ledger is the only durable state on the intake side: every BUY fill,
//! its remaining unsold tokens, and nothing else.

mod ledger;

pub use ledger::{LotAllocation, OpenHolding, PurchaseLedger, SaleAllocation, SellAmount};

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection and apply migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Each in-memory connection is its own database, so keep exactly one alive.
        let in_memory = database_url.contains(":memory:");
        let options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Fresh private in-memory database.
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> Result<()> {
        // Decimal quantities are stored as TEXT to keep them exact.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS purchases (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                market_id TEXT NOT NULL,
                asset_id TEXT NOT NULL,
                tokens_bought TEXT NOT NULL,
                tokens_remaining TEXT NOT NULL,
                price TEXT NOT NULL,
                usdc_spent TEXT NOT NULL,
                purchased_at INTEGER NOT NULL,
                source_trader TEXT NOT NULL,
                intent_id TEXT NOT NULL,
                order_id TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create purchases table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_purchases_fifo ON purchases(market_id, asset_id, purchased_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
