//! Connection pools for the run store.
//!
//! Every run mutation goes through a single writer connection: the
//! find-or-create transaction and the lock-guarded cursor, error, release
//! and finish updates are serialized there, so two workers racing on the
//! same idempotency key never interleave inside SQLite. Lookups
//! (`get_run`, `find_by_idempotency_key`, `list_awaiting`) use a separate
//! read-only pool. WAL journaling lets those readers see committed runs
//! without waiting on the writer.

use std::str::FromStr;
use std::time::Duration;

use acidic_types::config::AcidicConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Concurrent lookups allowed while a worker holds the writer.
const READER_CONNECTIONS: u32 = 8;

/// How long a connection waits on SQLite's file lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Reader and writer pools over one run-store database.
#[derive(Clone)]
pub struct DatabasePool {
    /// Read-only lookups of run records and awaited children.
    pub reader: SqlitePool,
    /// The only connection allowed to write `acidic_runs`.
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open the run store named by `config.database_url`.
    ///
    /// Creates the database's parent directory first, since the default
    /// location under `~/.acidic/` does not exist on a fresh machine.
    pub async fn open(config: &AcidicConfig) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?;
        if let Some(dir) = options.get_filename().parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await?;
            }
        }
        Self::new(&config.database_url).await
    }

    /// Connect both pools to `database_url` and apply pending migrations.
    ///
    /// Migrations run on the writer before any reader connects, so readers
    /// never observe a half-migrated schema.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .create_if_missing(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(base_opts.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(base_opts.read_only(true))
            .await?;

        tracing::debug!(database_url, readers = READER_CONNECTIONS, "run store opened");
        Ok(Self { reader, writer })
    }
}
