//! SQLite connection pool for the pipeline's persistent state.

use std::str::FromStr;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::config::Config;

const MAX_CONNECTIONS: u32 = 5;

/// Open (creating if needed) the database at the configured path.
///
/// WAL journaling lets the worker pool write while `ask` reads, and
/// foreign keys must be on for the chunk/reference cascades to fire.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    if let Some(dir) = config.db.path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db.path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal);

    Ok(SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?)
}
