//! Database module for the SQLite stores
//!
//! codex-lb keeps two logical stores: the main store (usage history, request
//! logs, sticky sessions, dashboard settings) and the accounts store. They
//! normally share one database file; setting `CODEX_LB_ACCOUNTS_DATABASE_URL`
//! splits accounts into their own file. Migrations are embedded and applied
//! on startup, each store tracking its own applied set.

pub mod models;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::error::{Error, Result};

/// Database connections for both stores
#[derive(Clone)]
pub struct Database {
    main: SqlitePool,
    accounts: SqlitePool,
}

impl Database {
    /// Open pools per the configuration and run migrations.
    pub async fn connect(config: &Config) -> Result<Self> {
        let main = open_pool(&config.database_url).await?;
        let accounts = match &config.accounts_database_url {
            Some(url) => open_pool(url).await?,
            None => main.clone(),
        };

        let db = Self { main, accounts };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Build from existing pools (tests wire in-memory pools this way).
    pub async fn from_pools(main: SqlitePool, accounts: SqlitePool) -> Result<Self> {
        let db = Self { main, accounts };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn main(&self) -> &SqlitePool {
        &self.main
    }

    pub fn accounts(&self) -> &SqlitePool {
        &self.accounts
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations/main")
            .run(&self.main)
            .await
            .map_err(|e| Error::Database(format!("Failed to run main migrations: {e}")))?;
        sqlx::migrate!("./migrations/accounts")
            .run(&self.accounts)
            .await
            .map_err(|e| Error::Database(format!("Failed to run accounts migrations: {e}")))?;
        Ok(())
    }

    /// Close both pools; waits for checked-out connections to return.
    pub async fn close(&self) {
        self.main.close().await;
        if !self.accounts.is_closed() {
            self.accounts.close().await;
        }
    }
}

async fn open_pool(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(|e| Error::Configuration(format!("Invalid database URL '{url}': {e}")))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(false);

    SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
        .map_err(|e| Error::Database(format!("Failed to open '{url}': {e}")))
}

/// In-memory database for tests; single connection so every query sees the
/// same store.
#[doc(hidden)]
pub async fn memory_database() -> Result<Database> {
    let main = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| Error::Database(format!("Failed to open in-memory store: {e}")))?;
    let accounts = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .map_err(|e| Error::Database(format!("Failed to open in-memory store: {e}")))?;
    Database::from_pools(main, accounts).await
}
