//! `ProfileRepo`: read access plus the handful of profile-state mutations
//! that live outside the claim transaction (heartbeat, logged-out/blocked
//! flags flipped by the Driver or by an operator via the CLI).

use crate::db::postgres::PostgresPool;
use crate::db::Pool;
use crate::error::RepoError;
use crate::model::{Profile, ProfileId};
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

#[async_trait]
pub trait ProfileRepo: Send + Sync {
    async fn get(&self, profile_id: ProfileId) -> Result<Profile, RepoError>;

    /// All profiles eligible to run a worker: active, not blocked, not
    /// logged out (§3 `Profile`, §4.5 `is_eligible`). Eligibility is global,
    /// not scoped to a group — a profile can be handed any group's tasks.
    async fn list_eligible(&self) -> Result<Vec<Profile>, RepoError>;

    async fn mark_blocked(&self, profile_id: ProfileId, blocked: bool) -> Result<(), RepoError>;

    async fn mark_logged_out(&self, profile_id: ProfileId, logged_out: bool) -> Result<(), RepoError>;

    /// §4.4 `account_frozen` handling: `is_blocked = true`, `is_active =
    /// false`, in one write.
    async fn block_and_deactivate(&self, profile_id: ProfileId) -> Result<(), RepoError>;

    async fn record_heartbeat(&self, profile_id: ProfileId) -> Result<(), RepoError>;
}

pub struct DbProfileRepo<DB> {
    db: DB,
}

impl<DB: Pool> DbProfileRepo<DB> {
    pub fn new(db: DB) -> Self {
        Self { db }
    }
}

fn row_to_profile(row: &sqlx::postgres::PgRow) -> Result<Profile, RepoError> {
    Ok(Profile {
        profile_id: ProfileId(row.try_get("profile_id").map_err(RepoError::Internal)?),
        name: row.try_get("name").map_err(RepoError::Internal)?,
        is_active: row.try_get("is_active").map_err(RepoError::Internal)?,
        is_blocked: row.try_get("is_blocked").map_err(RepoError::Internal)?,
        is_logged_out: row.try_get("is_logged_out").map_err(RepoError::Internal)?,
        messages_sent_current_hour: row
            .try_get("messages_sent_current_hour")
            .map_err(RepoError::Internal)?,
        hour_window_start: row
            .try_get("hour_window_start")
            .map_err(RepoError::Internal)?,
        last_message_at: row.try_get("last_message_at").map_err(RepoError::Internal)?,
        last_heartbeat_at: row
            .try_get("last_heartbeat_at")
            .map_err(RepoError::Internal)?,
    })
}

#[async_trait]
impl ProfileRepo for DbProfileRepo<PostgresPool> {
    #[instrument(skip(self), fields(repo = "profile", op = "get"))]
    async fn get(&self, profile_id: ProfileId) -> Result<Profile, RepoError> {
        let row = sqlx::query(
            r#"
            SELECT profile_id, name, is_active, is_blocked, is_logged_out,
                   messages_sent_current_hour, hour_window_start, last_message_at,
                   last_heartbeat_at
            FROM profiles
            WHERE profile_id = $1
            "#,
        )
        .bind(profile_id.0)
        .fetch_optional(self.db.pool())
        .await
        .map_err(RepoError::Internal)?
        .ok_or(RepoError::NotFound)?;
        row_to_profile(&row)
    }

    #[instrument(skip(self), fields(repo = "profile", op = "list_eligible"))]
    async fn list_eligible(&self) -> Result<Vec<Profile>, RepoError> {
        let rows = sqlx::query(
            r#"
            SELECT profile_id, name, is_active, is_blocked, is_logged_out,
                   messages_sent_current_hour, hour_window_start, last_message_at,
                   last_heartbeat_at
            FROM profiles
            WHERE is_active AND NOT is_blocked AND NOT is_logged_out
            "#,
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;
        rows.iter().map(row_to_profile).collect()
    }

    #[instrument(skip(self), fields(repo = "profile", op = "mark_blocked"))]
    async fn mark_blocked(&self, profile_id: ProfileId, blocked: bool) -> Result<(), RepoError> {
        sqlx::query("UPDATE profiles SET is_blocked = $2 WHERE profile_id = $1")
            .bind(profile_id.0)
            .bind(blocked)
            .execute(self.db.pool())
            .await
            .map_err(RepoError::Internal)?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "profile", op = "mark_logged_out"))]
    async fn mark_logged_out(&self, profile_id: ProfileId, logged_out: bool) -> Result<(), RepoError> {
        sqlx::query("UPDATE profiles SET is_logged_out = $2 WHERE profile_id = $1")
            .bind(profile_id.0)
            .bind(logged_out)
            .execute(self.db.pool())
            .await
            .map_err(RepoError::Internal)?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "profile", op = "block_and_deactivate"))]
    async fn block_and_deactivate(&self, profile_id: ProfileId) -> Result<(), RepoError> {
        sqlx::query("UPDATE profiles SET is_blocked = true, is_active = false WHERE profile_id = $1")
            .bind(profile_id.0)
            .execute(self.db.pool())
            .await
            .map_err(RepoError::Internal)?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "profile", op = "record_heartbeat"))]
    async fn record_heartbeat(&self, profile_id: ProfileId) -> Result<(), RepoError> {
        sqlx::query("UPDATE profiles SET last_heartbeat_at = now() WHERE profile_id = $1")
            .bind(profile_id.0)
            .execute(self.db.pool())
            .await
            .map_err(RepoError::Internal)?;
        Ok(())
    }
}
