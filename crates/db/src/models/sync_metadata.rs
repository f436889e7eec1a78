//! Best-effort per-tool update tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncMetadata {
    pub tool_id: String,
    pub installed_version: Option<String>,
    pub last_checked_at: DateTime<Utc>,
}

impl SyncMetadata {
    /// Record the version observed for a tool. Best-effort: callers log
    /// and continue on failure.
    pub async fn upsert(
        pool: &SqlitePool,
        tool_id: &str,
        installed_version: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"INSERT INTO sync_metadata (tool_id, installed_version, last_checked_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (tool_id) DO UPDATE SET
                   installed_version = excluded.installed_version,
                   last_checked_at = excluded.last_checked_at"#,
        )
        .bind(tool_id)
        .bind(installed_version)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find(pool: &SqlitePool, tool_id: &str) -> Result<Option<SyncMetadata>, sqlx::Error> {
        sqlx::query_as::<_, SyncMetadata>(r#"SELECT * FROM sync_metadata WHERE tool_id = $1"#)
            .bind(tool_id)
            .fetch_optional(pool)
            .await
    }
}
