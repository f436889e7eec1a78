//! Launch history for external AI tools.
//!
//! One row per (tool, project, user). The orchestration core owns exactly
//! two write paths (`record_launch`, `close_session`) and one read path
//! (`has_been_launched_before`); everything else about this table belongs
//! to the wider application.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Lifecycle of a recorded launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, TS)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum LaunchStatus {
    Active,
    Closed,
}

/// Metadata captured at launch time, stored as a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LaunchMetadata {
    /// Installed tool version at the time of launch, if known.
    pub tool_version: Option<String>,
    /// Whether the launch used the tool's resume flag.
    pub resumed: bool,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ToolLaunch {
    pub id: Uuid,
    pub tool_id: String,
    pub project_path: String,
    pub user_id: String,
    pub launch_count: i64,
    pub status: LaunchStatus,
    pub metadata: Option<String>,
    pub first_launched_at: DateTime<Utc>,
    pub last_launched_at: DateTime<Utc>,
}

/// The core always writes under this user until multi-user support lands
/// in the wider application.
const LOCAL_USER: &str = "local";

impl ToolLaunch {
    /// Record a successful launch of `tool_id` into `project_path`.
    ///
    /// Inserts on first launch, otherwise increments the counter and
    /// refreshes `last_launched_at`. Single statement; no transaction.
    pub async fn record_launch(
        pool: &SqlitePool,
        tool_id: &str,
        project_path: &str,
        metadata: &LaunchMetadata,
    ) -> Result<ToolLaunch, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let metadata_json = serde_json::to_string(metadata).ok();

        sqlx::query_as::<_, ToolLaunch>(
            r#"INSERT INTO ai_tool_launches
                   (id, tool_id, project_path, user_id, launch_count, status,
                    metadata, first_launched_at, last_launched_at)
               VALUES ($1, $2, $3, $4, 1, 'active', $5, $6, $6)
               ON CONFLICT (tool_id, project_path, user_id) DO UPDATE SET
                   launch_count = launch_count + 1,
                   status = 'active',
                   metadata = excluded.metadata,
                   last_launched_at = excluded.last_launched_at
               RETURNING *"#,
        )
        .bind(id)
        .bind(tool_id)
        .bind(project_path)
        .bind(LOCAL_USER)
        .bind(metadata_json)
        .bind(now)
        .fetch_one(pool)
        .await
    }

    /// Mark the (tool, project) session closed after the process exits.
    pub async fn close_session(
        pool: &SqlitePool,
        tool_id: &str,
        project_path: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"UPDATE ai_tool_launches
               SET status = 'closed'
               WHERE tool_id = $1 AND project_path = $2 AND user_id = $3"#,
        )
        .bind(tool_id)
        .bind(project_path)
        .bind(LOCAL_USER)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Whether this tool has ever been launched into this project.
    ///
    /// Drives resume-flag selection: a prior launch means the tool may
    /// have session state worth resuming.
    pub async fn has_been_launched_before(
        pool: &SqlitePool,
        tool_id: &str,
        project_path: &str,
    ) -> Result<bool, sqlx::Error> {
        let exists: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(
                   SELECT 1 FROM ai_tool_launches
                   WHERE tool_id = $1 AND project_path = $2 AND user_id = $3
               )"#,
        )
        .bind(tool_id)
        .bind(project_path)
        .bind(LOCAL_USER)
        .fetch_one(pool)
        .await?;
        Ok(exists)
    }

    pub async fn find(
        pool: &SqlitePool,
        tool_id: &str,
        project_path: &str,
    ) -> Result<Option<ToolLaunch>, sqlx::Error> {
        sqlx::query_as::<_, ToolLaunch>(
            r#"SELECT * FROM ai_tool_launches
               WHERE tool_id = $1 AND project_path = $2 AND user_id = $3"#,
        )
        .bind(tool_id)
        .bind(project_path)
        .bind(LOCAL_USER)
        .fetch_optional(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::in_memory_db;

    fn meta(resumed: bool) -> LaunchMetadata {
        LaunchMetadata {
            tool_version: Some("1.2.3".to_string()),
            resumed,
        }
    }

    #[tokio::test]
    async fn test_first_launch_inserts_row() {
        let db = in_memory_db().await;

        assert!(
            !ToolLaunch::has_been_launched_before(&db.pool, "claude-code", "/projects/x")
                .await
                .unwrap()
        );

        let row = ToolLaunch::record_launch(&db.pool, "claude-code", "/projects/x", &meta(false))
            .await
            .unwrap();

        assert_eq!(row.launch_count, 1);
        assert_eq!(row.status, LaunchStatus::Active);
        assert_eq!(row.first_launched_at, row.last_launched_at);
        assert!(
            ToolLaunch::has_been_launched_before(&db.pool, "claude-code", "/projects/x")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_launch_count_increments_per_launch() {
        let db = in_memory_db().await;

        for expected in 1..=3i64 {
            let row = ToolLaunch::record_launch(&db.pool, "aider", "/projects/y", &meta(false))
                .await
                .unwrap();
            assert_eq!(row.launch_count, expected);
        }
    }

    #[tokio::test]
    async fn test_close_then_relaunch_reactivates() {
        let db = in_memory_db().await;

        ToolLaunch::record_launch(&db.pool, "claude-code", "/projects/z", &meta(false))
            .await
            .unwrap();
        ToolLaunch::close_session(&db.pool, "claude-code", "/projects/z")
            .await
            .unwrap();

        let row = ToolLaunch::find(&db.pool, "claude-code", "/projects/z")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, LaunchStatus::Closed);

        // History survives the close, so the second launch resumes
        let row = ToolLaunch::record_launch(&db.pool, "claude-code", "/projects/z", &meta(true))
            .await
            .unwrap();
        assert_eq!(row.launch_count, 2);
        assert_eq!(row.status, LaunchStatus::Active);

        let metadata: LaunchMetadata = serde_json::from_str(row.metadata.as_deref().unwrap()).unwrap();
        assert!(metadata.resumed);
    }

    #[tokio::test]
    async fn test_projects_are_tracked_independently() {
        let db = in_memory_db().await;

        ToolLaunch::record_launch(&db.pool, "claude-code", "/projects/a", &meta(false))
            .await
            .unwrap();

        assert!(
            !ToolLaunch::has_been_launched_before(&db.pool, "claude-code", "/projects/b")
                .await
                .unwrap()
        );
    }
}
