//! `StatsRepo`: read-only aggregate queries for the `status` control surface
//! (§4.10). Writes to `ProfileDailyStats` happen inline in `TaskRepo`'s
//! `record_success`/`record_failure`; this repo only reads them back.

use crate::db::postgres::PostgresPool;
use crate::db::Pool;
use crate::error::RepoError;
use crate::model::{GroupId, ProfileDailyStats, ProfileId};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::Row;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct GroupProgress {
    pub group_id: GroupId,
    pub total_tasks: i64,
    pub completed_tasks: i64,
    pub blocked_tasks: i64,
    pub in_progress_tasks: i64,
}

#[async_trait]
pub trait StatsRepo: Send + Sync {
    async fn daily_stats_for_profile(
        &self,
        profile_id: ProfileId,
        date: NaiveDate,
    ) -> Result<Option<ProfileDailyStats>, RepoError>;

    async fn group_progress(&self, group_id: GroupId) -> Result<GroupProgress, RepoError>;
}

pub struct DbStatsRepo<DB> {
    db: DB,
}

impl<DB: Pool> DbStatsRepo<DB> {
    pub fn new(db: DB) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StatsRepo for DbStatsRepo<PostgresPool> {
    #[instrument(skip(self), fields(repo = "stats", op = "daily_stats_for_profile"))]
    async fn daily_stats_for_profile(
        &self,
        profile_id: ProfileId,
        date: NaiveDate,
    ) -> Result<Option<ProfileDailyStats>, RepoError> {
        let row = sqlx::query(
            r#"
            SELECT profile_id, date, messages_sent, successful_sends, failed_sends
            FROM profile_daily_stats
            WHERE profile_id = $1 AND date = $2
            "#,
        )
        .bind(profile_id.0)
        .bind(date)
        .fetch_optional(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;

        row.map(|row| {
            Ok(ProfileDailyStats {
                profile_id: ProfileId(row.try_get("profile_id").map_err(RepoError::Internal)?),
                date: row.try_get("date").map_err(RepoError::Internal)?,
                messages_sent: row.try_get("messages_sent").map_err(RepoError::Internal)?,
                successful_sends: row
                    .try_get("successful_sends")
                    .map_err(RepoError::Internal)?,
                failed_sends: row.try_get("failed_sends").map_err(RepoError::Internal)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self), fields(repo = "stats", op = "group_progress"))]
    async fn group_progress(&self, group_id: GroupId) -> Result<GroupProgress, RepoError> {
        let row = sqlx::query(
            r#"
            SELECT
                count(*) AS total_tasks,
                count(*) FILTER (WHERE status = 'completed') AS completed_tasks,
                count(*) FILTER (WHERE status = 'blocked') AS blocked_tasks,
                count(*) FILTER (WHERE status = 'in_progress') AS in_progress_tasks
            FROM tasks
            WHERE group_id = $1
            "#,
        )
        .bind(group_id.0)
        .fetch_one(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;

        Ok(GroupProgress {
            group_id,
            total_tasks: row.try_get("total_tasks").map_err(RepoError::Internal)?,
            completed_tasks: row
                .try_get("completed_tasks")
                .map_err(RepoError::Internal)?,
            blocked_tasks: row.try_get("blocked_tasks").map_err(RepoError::Internal)?,
            in_progress_tasks: row
                .try_get("in_progress_tasks")
                .map_err(RepoError::Internal)?,
        })
    }
}
