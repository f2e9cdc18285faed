//! `TaskRepo`: everything §4.2 ("TaskQueue") needs from the Store. The claim
//! query and the two recording queries are each one transaction; that is the
//! atomicity boundary the whole scheduler's correctness rests on (§8
//! properties 1-4).

use crate::db::postgres::PostgresPool;
use crate::db::Pool;
use crate::error::RepoError;
use crate::model::{GroupId, ProfileId, RunId, Task, TaskId, TaskStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::Row;
use tracing::instrument;

pub enum ClaimOutcome {
    Claimed(Task),
    RateLimited,
    NoTask,
}

pub struct RecordSuccessOutcome {
    pub task_completed: bool,
}

pub struct RecordFailureOutcome {
    pub task_blocked: bool,
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    /// §4.2 `ClaimNext`. `max_messages_per_hour = 0` means "unlimited".
    async fn claim_next(
        &self,
        group_id: GroupId,
        profile_id: ProfileId,
        run_id: RunId,
        max_messages_per_hour: u32,
    ) -> Result<ClaimOutcome, RepoError>;

    /// §4.2 `RecordSuccess`, minus the `ProxyStats` write (owned by
    /// `ProxyRegistry`, see `repo::proxy`).
    #[allow(clippy::too_many_arguments)]
    async fn record_success(
        &self,
        task_id: TaskId,
        profile_id: ProfileId,
        run_id: RunId,
        cycle_number: i32,
        message_text: &str,
        cycle_delay: ChronoDuration,
    ) -> Result<RecordSuccessOutcome, RepoError>;

    /// §4.2 `RecordFailure`'s attempt-row + counter bookkeeping. The caller
    /// (the `ErrorClassifier`, via `TaskQueue`) decides `block`/`advance_cycle`
    /// /`next_available_at` and passes the decision down so this stays a
    /// dumb, total write.
    async fn record_failure(
        &self,
        task_id: TaskId,
        profile_id: ProfileId,
        run_id: RunId,
        cycle_number: i32,
        error_kind: &str,
        block_reason: Option<&str>,
        next_available_at: Option<DateTime<Utc>>,
    ) -> Result<RecordFailureOutcome, RepoError>;

    /// Releases a claimed-but-not-recorded task back to `pending`, used both
    /// by cooperative cancellation (§5) and by `slow_mode` handling (§4.4).
    async fn release(
        &self,
        task_id: TaskId,
        next_available_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError>;

    /// §4.2 stale-claim reaper. Idempotent by construction: re-running it
    /// only touches rows whose `last_attempt_at` is still older than the
    /// grace window, and those rows are no longer `in_progress` once reset.
    async fn reset_stale(&self, max_age: ChronoDuration) -> Result<u64, RepoError>;

    /// Counts attempts for a task under the given run, used by tests and by
    /// `status` reporting; not on the hot claim path.
    async fn attempts_in_run(&self, task_id: TaskId, run_id: RunId) -> Result<i64, RepoError>;
}

pub struct DbTaskRepo<DB> {
    db: DB,
}

impl<DB: Pool> DbTaskRepo<DB> {
    pub fn new(db: DB) -> Self {
        Self { db }
    }
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, RepoError> {
    let status: String = row.try_get("status").map_err(RepoError::Internal)?;
    let status = match status.as_str() {
        "pending" => TaskStatus::Pending,
        "in_progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        "blocked" => TaskStatus::Blocked,
        other => {
            return Err(RepoError::Internal(sqlx::Error::Decode(
                format!("unknown task status {other}").into(),
            )))
        }
    };
    Ok(Task {
        id: TaskId(row.try_get("id").map_err(RepoError::Internal)?),
        group_id: GroupId(row.try_get("group_id").map_err(RepoError::Internal)?),
        chat_ref: row.try_get("chat_ref").map_err(RepoError::Internal)?,
        status,
        assigned_profile_id: row
            .try_get::<Option<uuid::Uuid>, _>("assigned_profile_id")
            .map_err(RepoError::Internal)?
            .map(ProfileId),
        total_cycles: row.try_get("total_cycles").map_err(RepoError::Internal)?,
        completed_cycles: row
            .try_get("completed_cycles")
            .map_err(RepoError::Internal)?,
        success_count: row.try_get("success_count").map_err(RepoError::Internal)?,
        failed_count: row.try_get("failed_count").map_err(RepoError::Internal)?,
        is_blocked: row.try_get("is_blocked").map_err(RepoError::Internal)?,
        block_reason: row.try_get("block_reason").map_err(RepoError::Internal)?,
        last_attempt_at: row
            .try_get("last_attempt_at")
            .map_err(RepoError::Internal)?,
        next_available_at: row
            .try_get("next_available_at")
            .map_err(RepoError::Internal)?,
    })
}

#[async_trait]
impl TaskRepo for DbTaskRepo<PostgresPool> {
    #[instrument(skip(self), fields(repo = "task", op = "claim_next"))]
    async fn claim_next(
        &self,
        group_id: GroupId,
        profile_id: ProfileId,
        run_id: RunId,
        max_messages_per_hour: u32,
    ) -> Result<ClaimOutcome, RepoError> {
        self.db
            .with_tx(|tx| {
                Box::pin(async move {
                    let refreshed = sqlx::query(
                        r#"
                        UPDATE profiles
                        SET messages_sent_current_hour =
                                CASE WHEN now() - hour_window_start >= interval '1 hour'
                                     THEN 0 ELSE messages_sent_current_hour END,
                            hour_window_start =
                                CASE WHEN now() - hour_window_start >= interval '1 hour'
                                     THEN now() ELSE hour_window_start END
                        WHERE profile_id = $1
                        RETURNING messages_sent_current_hour
                        "#,
                    )
                    .bind(profile_id.0)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let sent_this_hour: i32 = refreshed
                        .try_get("messages_sent_current_hour")
                        .map_err(RepoError::Internal)?;

                    if max_messages_per_hour > 0 && sent_this_hour as u32 >= max_messages_per_hour
                    {
                        return Ok(ClaimOutcome::RateLimited);
                    }

                    let candidate = sqlx::query(
                        r#"
                        SELECT id, group_id, chat_ref, status, assigned_profile_id, total_cycles,
                               completed_cycles, success_count, failed_count, is_blocked,
                               block_reason, last_attempt_at, next_available_at
                        FROM tasks
                        WHERE group_id = $1
                          AND is_blocked = false
                          AND completed_cycles < total_cycles
                          AND (next_available_at IS NULL OR next_available_at <= now())
                          AND (
                                status = 'pending'
                                OR (status = 'in_progress' AND assigned_profile_id = $2)
                              )
                          AND (
                                SELECT count(*) FROM task_attempts ta
                                WHERE ta.task_id = tasks.id AND ta.run_id = $3
                              ) < total_cycles
                        ORDER BY completed_cycles ASC, last_attempt_at ASC NULLS FIRST, id ASC
                        FOR UPDATE SKIP LOCKED
                        LIMIT 1
                        "#,
                    )
                    .bind(group_id.0)
                    .bind(profile_id.0)
                    .bind(run_id.0)
                    .fetch_optional(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let Some(candidate) = candidate else {
                        return Ok(ClaimOutcome::NoTask);
                    };

                    let task_id: i64 = candidate.try_get("id").map_err(RepoError::Internal)?;

                    let claimed = sqlx::query(
                        r#"
                        UPDATE tasks
                        SET status = 'in_progress', assigned_profile_id = $1
                        WHERE id = $2
                        RETURNING id, group_id, chat_ref, status, assigned_profile_id,
                                  total_cycles, completed_cycles, success_count, failed_count,
                                  is_blocked, block_reason, last_attempt_at, next_available_at
                        "#,
                    )
                    .bind(profile_id.0)
                    .bind(task_id)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    Ok(ClaimOutcome::Claimed(row_to_task(&claimed)?))
                })
            })
            .await
    }

    #[instrument(skip(self, message_text), fields(repo = "task", op = "record_success"))]
    async fn record_success(
        &self,
        task_id: TaskId,
        profile_id: ProfileId,
        run_id: RunId,
        cycle_number: i32,
        message_text: &str,
        cycle_delay: ChronoDuration,
    ) -> Result<RecordSuccessOutcome, RepoError> {
        let message_text = message_text.to_string();
        self.db
            .with_tx(move |tx| {
                let message_text = message_text.clone();
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO task_attempts (task_id, profile_id, run_id, cycle_number, status, message_text)
                        VALUES ($1, $2, $3, $4, 'success', $5)
                        "#,
                    )
                    .bind(task_id.0)
                    .bind(profile_id.0)
                    .bind(run_id.0)
                    .bind(cycle_number)
                    .bind(&message_text)
                    .execute(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let updated = sqlx::query(
                        r#"
                        UPDATE tasks
                        SET completed_cycles = completed_cycles + 1,
                            success_count = success_count + 1,
                            last_attempt_at = now(),
                            next_available_at = now() + make_interval(secs => $2),
                            status = CASE WHEN completed_cycles + 1 >= total_cycles
                                          THEN 'completed' ELSE 'pending' END
                        WHERE id = $1
                        RETURNING status
                        "#,
                    )
                    .bind(task_id.0)
                    .bind(cycle_delay.num_seconds() as f64)
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let status: String = updated.try_get("status").map_err(RepoError::Internal)?;

                    sqlx::query(
                        r#"
                        UPDATE profiles
                        SET messages_sent_current_hour = messages_sent_current_hour + 1,
                            last_message_at = now()
                        WHERE profile_id = $1
                        "#,
                    )
                    .bind(profile_id.0)
                    .execute(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    sqlx::query(
                        r#"
                        INSERT INTO profile_daily_stats (profile_id, date, messages_sent, successful_sends, failed_sends)
                        VALUES ($1, CURRENT_DATE, 1, 1, 0)
                        ON CONFLICT (profile_id, date) DO UPDATE
                        SET messages_sent = profile_daily_stats.messages_sent + 1,
                            successful_sends = profile_daily_stats.successful_sends + 1
                        "#,
                    )
                    .bind(profile_id.0)
                    .execute(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    Ok(RecordSuccessOutcome {
                        task_completed: status == "completed",
                    })
                })
            })
            .await
    }

    #[instrument(skip(self), fields(repo = "task", op = "record_failure"))]
    async fn record_failure(
        &self,
        task_id: TaskId,
        profile_id: ProfileId,
        run_id: RunId,
        cycle_number: i32,
        error_kind: &str,
        block_reason: Option<&str>,
        next_available_at: Option<DateTime<Utc>>,
    ) -> Result<RecordFailureOutcome, RepoError> {
        let error_kind = error_kind.to_string();
        let block_reason = block_reason.map(|s| s.to_string());
        self.db
            .with_tx(move |tx| {
                let error_kind = error_kind.clone();
                let block_reason = block_reason.clone();
                Box::pin(async move {
                    sqlx::query(
                        r#"
                        INSERT INTO task_attempts (task_id, profile_id, run_id, cycle_number, status, error_kind)
                        VALUES ($1, $2, $3, $4, 'failed', $5)
                        "#,
                    )
                    .bind(task_id.0)
                    .bind(profile_id.0)
                    .bind(run_id.0)
                    .bind(cycle_number)
                    .bind(&error_kind)
                    .execute(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let blocked = block_reason.is_some();
                    let updated = sqlx::query(
                        r#"
                        UPDATE tasks
                        SET failed_count = failed_count + 1,
                            last_attempt_at = now(),
                            assigned_profile_id = NULL,
                            next_available_at = $2,
                            is_blocked = $3 OR is_blocked,
                            block_reason = COALESCE($4, block_reason),
                            status = CASE WHEN $3 THEN 'blocked' ELSE 'pending' END
                        WHERE id = $1
                        RETURNING is_blocked
                        "#,
                    )
                    .bind(task_id.0)
                    .bind(next_available_at)
                    .bind(blocked)
                    .bind(block_reason.as_deref())
                    .fetch_one(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    let is_blocked: bool = updated.try_get("is_blocked").map_err(RepoError::Internal)?;

                    sqlx::query(
                        r#"
                        INSERT INTO profile_daily_stats (profile_id, date, messages_sent, successful_sends, failed_sends)
                        VALUES ($1, CURRENT_DATE, 1, 0, 1)
                        ON CONFLICT (profile_id, date) DO UPDATE
                        SET messages_sent = profile_daily_stats.messages_sent + 1,
                            failed_sends = profile_daily_stats.failed_sends + 1
                        "#,
                    )
                    .bind(profile_id.0)
                    .execute(&mut **tx)
                    .await
                    .map_err(RepoError::Internal)?;

                    Ok(RecordFailureOutcome {
                        task_blocked: is_blocked,
                    })
                })
            })
            .await
    }

    #[instrument(skip(self), fields(repo = "task", op = "release"))]
    async fn release(
        &self,
        task_id: TaskId,
        next_available_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', assigned_profile_id = NULL, next_available_at = $2
            WHERE id = $1 AND status = 'in_progress'
            "#,
        )
        .bind(task_id.0)
        .bind(next_available_at)
        .execute(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;
        Ok(())
    }

    #[instrument(skip(self), fields(repo = "task", op = "reset_stale"))]
    async fn reset_stale(&self, max_age: ChronoDuration) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', assigned_profile_id = NULL
            WHERE status = 'in_progress'
              AND (last_attempt_at IS NULL OR last_attempt_at < now() - make_interval(secs => $1))
            "#,
        )
        .bind(max_age.num_seconds() as f64)
        .execute(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;
        Ok(result.rows_affected())
    }

    async fn attempts_in_run(&self, task_id: TaskId, run_id: RunId) -> Result<i64, RepoError> {
        let row = sqlx::query(
            "SELECT count(*) AS n FROM task_attempts WHERE task_id = $1 AND run_id = $2",
        )
        .bind(task_id.0)
        .bind(run_id.0)
        .fetch_one(self.db.pool())
        .await
        .map_err(RepoError::Internal)?;
        row.try_get("n").map_err(RepoError::Internal)
    }
}
