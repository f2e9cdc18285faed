//! `TaskQueue` (§4.2): the policy layer over `TaskRepo` — it is where the
//! pacing arithmetic of `rate.rs` meets the raw claim/record primitives the
//! repo exposes.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rng;

use crate::config::RateConfig;
use crate::error::RepoError;
use crate::model::{GroupId, ProfileId, RunId, TaskId};
use crate::rate;
use crate::repo::{ClaimOutcome, RecordFailureOutcome, RecordSuccessOutcome, TaskRepo};

pub struct TaskQueue<R: TaskRepo> {
    repo: Arc<R>,
}

impl<R: TaskRepo> TaskQueue<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub async fn claim_next(
        &self,
        group_id: GroupId,
        profile_id: ProfileId,
        run_id: RunId,
        max_messages_per_hour: u32,
    ) -> Result<ClaimOutcome, RepoError> {
        self.repo
            .claim_next(group_id, profile_id, run_id, max_messages_per_hour)
            .await
    }

    /// §4.2 `RecordSuccess`. The reschedule delay is computed here (§9's
    /// `max(cycle_delay, hourly_pace_delay)` resolution) and handed to the
    /// repo as a plain duration for it to apply server-side.
    pub async fn record_success(
        &self,
        task_id: TaskId,
        profile_id: ProfileId,
        run_id: RunId,
        cycle_number: i32,
        message_text: &str,
        rate: &RateConfig,
    ) -> Result<RecordSuccessOutcome, RepoError> {
        let delay = rate::effective_cycle_delay(
            rate.cycle_delay,
            rate.max_messages_per_hour,
            rate.delay_randomness,
            &mut rng(),
        );
        let delay = ChronoDuration::from_std(delay).unwrap_or(ChronoDuration::zero());
        self.repo
            .record_success(task_id, profile_id, run_id, cycle_number, message_text, delay)
            .await
    }

    pub async fn record_failure(
        &self,
        task_id: TaskId,
        profile_id: ProfileId,
        run_id: RunId,
        cycle_number: i32,
        error_kind: &str,
        block_reason: Option<&str>,
        next_available_at: Option<DateTime<Utc>>,
    ) -> Result<RecordFailureOutcome, RepoError> {
        self.repo
            .record_failure(
                task_id,
                profile_id,
                run_id,
                cycle_number,
                error_kind,
                block_reason,
                next_available_at,
            )
            .await
    }

    pub async fn release(
        &self,
        task_id: TaskId,
        next_available_at: Option<DateTime<Utc>>,
    ) -> Result<(), RepoError> {
        self.repo.release(task_id, next_available_at).await
    }

    pub async fn reset_stale(&self, max_age: ChronoDuration) -> Result<u64, RepoError> {
        self.repo.reset_stale(max_age).await
    }
}
