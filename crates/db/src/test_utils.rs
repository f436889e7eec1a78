//! Helpers for constructing throwaway databases in tests.

use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

use crate::DBService;

/// Create an in-memory database with all migrations applied.
///
/// A single connection keeps the `:memory:` database alive for the
/// lifetime of the pool.
pub async fn in_memory_db() -> DBService {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .journal_mode(SqliteJournalMode::Memory);

    let pool: Pool<Sqlite> = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect_with(options)
        .await
        .expect("failed to open in-memory sqlite");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations failed");

    DBService { pool }
}
