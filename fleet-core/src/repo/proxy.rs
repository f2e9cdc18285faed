//! `ProxyRepo`: backs the `ProxyRegistry` (§4.3). `ProxyRegistry` is the sole
//! writer of `ProxyAssignment` and `ProxyStats`; this repo just gives it
//! atomic primitives to build `Resolve`/`Assign`/`Rotate`/`MarkUnhealthy`/
//! `ObserveOutcome` on top of.

use crate::db::postgres::PostgresPool;
use crate::db::Pool;
use crate::error::RepoError;
use crate::model::{ProfileId, ProxyAssignment, ProxyStats};
use async_trait::async_trait;
use sqlx::Row;
use tracing::instrument;

#[async_trait]
pub trait ProxyRepo: Send + Sync {
    async fn get_for_profile(&self, profile_id: ProfileId) -> Result<Option<ProxyAssignment>, RepoError>;

    /// Claims one healthy, unassigned proxy for `profile_id` under
    /// `FOR UPDATE SKIP LOCKED`, so two workers racing to resolve a proxy
    /// never hand out the same URL. Returns `None` when the pool is
    /// exhausted (`ProxyError::Exhausted` is raised by the caller).
    async fn claim_unassigned(&self, profile_id: ProfileId) -> Result<Option<ProxyAssignment>, RepoError>;

    /// Releases the current assignment and claims a fresh healthy proxy in
    /// one transaction — §4.3 `Rotate`.
    async fn rotate(&self, profile_id: ProfileId) -> Result<Option<ProxyAssignment>, RepoError>;

    async fn mark_unhealthy(&self, proxy_url: &str) -> Result<(), RepoError>;

    async fn release(&self, profile_id: ProfileId) -> Result<(), RepoError>;

    /// §4.3 `ObserveOutcome`: upserts the rolling window row and returns it
    /// post-update so the caller can evaluate the rotation trigger.
    async fn observe_outcome(
        &self,
        proxy_url: &str,
        profile_id: ProfileId,
        chat_not_found: bool,
        success: bool,
    ) -> Result<ProxyStats, RepoError>;
}

pub struct DbProxyRepo<DB> {
    db: DB,
}

impl<DB: Pool> DbProxyRepo<DB> {
    pub fn new(db: DB) -> Self {
        Self { db }
    }
}

fn row_to_assignment(row: &sqlx::postgres::PgRow) -> Result<ProxyAssignment, RepoError> {
    Ok(ProxyAssignment {
        proxy_url: row.try_get("proxy_url").map_err(RepoError::Internal)?,
        profile_id: row
            .try_get::<Option<uuid::Uuid>, _>("profile_id")
            .map_err(RepoError::Internal)?
            .map(ProfileId),
        is_healthy: row.try_get("is_healthy").map_err(RepoError::Internal)?,
        assigned_at: row.try_get("assigned_at").map_err(RepoError::Internal)?,
        last_rotation_at: row
            .try_get("last_rotation_at")
            .map_err(RepoError::Internal)?,
    })
}

fn row_to_stats(row: &sqlx::postgres::PgRow) -> Result<ProxyStats, RepoError> {
    Ok(ProxyStats {
        proxy_url: row.try_get("proxy_url").map_err(RepoError::Internal)?,
        profile_id: ProfileId(row.try_get("profile_id").map_err(RepoError::Internal)?),
        total_attempts: row.try_get("total_attempts").map_err(RepoError::Internal)?,
        successful_sends: row
            .try_get("successful_sends")
            .map_err(RepoError::Internal)?,
        chat_not_found_count: row
            .try_get("chat_not_found_count")
            .map_err(RepoError::Internal)?,
        other_errors: row.try_get("other_errors").map_err(RepoError::Internal)?,
        period_start: row.try_get("period_start").map_err(RepoError::Internal)?,
        last_attempt_at: row
            .try_get("last_attempt_at")
            .map_err(RepoError::Internal)?,
    })
}

#[async_trait]
impl ProxyRepo for DbProxyRepo<PostgresPool> {
    #[instrument(skip(self), fields(repo = "proxy", op = "get_for_profile"))]
    async fn get_for_profile(&self, profile_id: ProfileId) -> Result<Option<ProxyAssignment>, RepoError> {
        let row = sqlx::query(
            r#"
            SELECT proxy_url, profile_id, is_healthy, assigned_at, last_rotation_at
            FROM proxy_assignments
            WHERE profile_id = $1
            "#,
        )
        .bind(profile_id.0)
        .fetch_optional(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;
        row.as_ref().map(row_to_assignment).transpose()
    }

    #[instrument(skip(self), fields(repo = "proxy", op = "claim_unassigned"))]
    async fn claim_unassigned(&self, profile_id: ProfileId) -> Result<Option<ProxyAssignment>, RepoError> {
        self.db
            .with_tx(move |tx| {
                Box::pin(async move {
                    let candidate = sqlx::query(
                        r#"
                        SELECT proxy_url FROM proxy_assignments
                        WHERE is_healthy AND profile_id IS NULL
                        ORDER BY proxy_url
                        FOR UPDATE SKIP LOCKED
                        LIMIT 1
                        "#,
                    )
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let Some(candidate) = candidate else {
                        return Ok(None);
                    };
                    let proxy_url: String =
                        candidate.try_get("proxy_url").map_err(RepoError::Internal)?;

                    let claimed = sqlx::query(
                        r#"
                        UPDATE proxy_assignments
                        SET profile_id = $1, assigned_at = now()
                        WHERE proxy_url = $2
                        RETURNING proxy_url, profile_id, is_healthy, assigned_at, last_rotation_at
                        "#,
                    )
                    .bind(profile_id.0)
                    .bind(&proxy_url)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    Ok(Some(row_to_assignment(&claimed)?))
                })
            })
            .await
    }

    #[instrument(skip(self), fields(repo = "proxy", op = "rotate"))]
    async fn rotate(&self, profile_id: ProfileId) -> Result<Option<ProxyAssignment>, RepoError> {
        self.db
            .with_tx(move |tx| {
                Box::pin(async move {
                    sqlx::query(
                        "UPDATE proxy_assignments SET profile_id = NULL WHERE profile_id = $1",
                    )
                    .bind(profile_id.0)
                    .execute(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let candidate = sqlx::query(
                        r#"
                        SELECT proxy_url FROM proxy_assignments
                        WHERE is_healthy AND profile_id IS NULL
                        ORDER BY proxy_url
                        FOR UPDATE SKIP LOCKED
                        LIMIT 1
                        "#,
                    )
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let Some(candidate) = candidate else {
                        return Ok(None);
                    };
                    let proxy_url: String =
                        candidate.try_get("proxy_url").map_err(RepoError::Internal)?;

                    let claimed = sqlx::query(
                        r#"
                        UPDATE proxy_assignments
                        SET profile_id = $1, assigned_at = now(), last_rotation_at = now()
                        WHERE proxy_url = $2
                        RETURNING proxy_url, profile_id, is_healthy, assigned_at, last_rotation_at
                        "#,
                    )
                    .bind(profile_id.0)
                    .bind(&proxy_url)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    Ok(Some(row_to_assignment(&claimed)?))
                })
            })
            .await
    }

    #[instrument(skip(self), fields(repo = "proxy", op = "mark_unhealthy"))]
    async fn mark_unhealthy(&self, proxy_url: &str) -> Result<(), RepoError> {
        sqlx::query("UPDATE proxy_assignments SET is_healthy = false WHERE proxy_url = $1")
            .bind(proxy_url)
            .execute(self.db.pool())
            .await
            .map_err(RepoError::Internal)?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "proxy", op = "release"))]
    async fn release(&self, profile_id: ProfileId) -> Result<(), RepoError> {
        sqlx::query("UPDATE proxy_assignments SET profile_id = NULL WHERE profile_id = $1")
            .bind(profile_id.0)
            .execute(self.db.pool())
            .await
            .map_err(RepoError::Internal)?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "proxy", op = "observe_outcome"))]
    async fn observe_outcome(
        &self,
        proxy_url: &str,
        profile_id: ProfileId,
        chat_not_found: bool,
        success: bool,
    ) -> Result<ProxyStats, RepoError> {
        let other_error = !success && !chat_not_found;
        let row = sqlx::query(
            r#"
            INSERT INTO proxy_stats
                (proxy_url, profile_id, total_attempts, successful_sends, chat_not_found_count, other_errors, last_attempt_at)
            VALUES ($1, $2, 1, $3, $4, $5, now())
            ON CONFLICT (proxy_url, profile_id) DO UPDATE
            SET total_attempts = proxy_stats.total_attempts + 1,
                successful_sends = proxy_stats.successful_sends + $3,
                chat_not_found_count = proxy_stats.chat_not_found_count + $4,
                other_errors = proxy_stats.other_errors + $5,
                last_attempt_at = now()
            RETURNING proxy_url, profile_id, total_attempts, successful_sends,
                      chat_not_found_count, other_errors, period_start, last_attempt_at
            "#,
        )
        .bind(proxy_url)
        .bind(profile_id.0)
        .bind(success as i64)
        .bind(chat_not_found as i64)
        .bind(other_error as i64)
        .fetch_one(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;
        row_to_stats(&row)
    }
}
