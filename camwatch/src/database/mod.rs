//! Persistence layer for probe heartbeats.
//!
//! SQLite through sqlx. One catalog table maps stream names to their history
//! tables; the history tables themselves are created on first write by the
//! heartbeat repository. Writes go through [`HeartbeatWriter`] so storage
//! latency never reaches the scheduling loop.

pub mod batching;
pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

pub use batching::{HeartbeatWriter, HeartbeatWriterConfig};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Lock wait before SQLite reports `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pragmas run on every new connection.
const CONNECTION_PRAGMAS: &[&str] = &[
    "PRAGMA wal_autocheckpoint = 1000",
    "PRAGMA journal_size_limit = 33554432",
    "PRAGMA cache_size = -8000",
    "PRAGMA temp_store = MEMORY",
];

/// Catalog of streams that have history. Endpoints are not stored.
const CATALOG_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS streams (
        name TEXT PRIMARY KEY,
        table_name TEXT NOT NULL,
        protocol TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
"#;

async fn prepare_connection(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    for pragma in CONNECTION_PRAGMAS {
        sqlx::query(pragma).execute(&mut *conn).await?;
    }
    Ok(())
}

/// Open (creating if needed) the heartbeat database.
///
/// `database_url` is a SQLite URL such as `sqlite:camwatch.db?mode=rwc`.
/// File databases run in WAL mode; in-memory ones keep SQLite's default.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .after_connect(|conn, _meta| Box::pin(async move { prepare_connection(conn).await }))
        .connect_with(connect_options)
        .await?;

    let mode: String = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?
        .get(0);
    tracing::info!(
        journal_mode = %mode,
        "Heartbeat database opened ({} max connections)",
        max_connections.max(1)
    );

    Ok(pool)
}

/// Create the stream catalog. Safe to run on every start.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query(CATALOG_SCHEMA).execute(pool).await?;
    Ok(())
}
