//! The per-profile Worker state machine (§4.5): `INIT → RESOLVE_PROXY →
//! LAUNCH → READY → CLAIMING → SENDING → RECORDING → PACING → CLAIMING`,
//! with the `FATAL`/`EMPTY`/`NO-TASK`/`TERMINAL`/`SHUTDOWN` exits folded
//! into a single `WorkerExit` the Supervisor interprets for restart policy.

use std::sync::Arc;
use std::time::Duration;

use rand::rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::classifier::{Classification, ErrorClassifier, Outcome, ProfileAction, ProxyAction, TaskAction, WorkerDirective};
use crate::clock::SharedClock;
use crate::config::{ClassifierConfig, RateConfig, TimeoutConfig};
use crate::driver::Driver;
use crate::model::{GroupId, Profile, RunId};
use crate::proxy_registry::ProxyRegistry;
use crate::queue::TaskQueue;
use crate::rate;
use crate::repo::{ClaimOutcome, MessageRepo, ProfileRepo, ProxyRepo, TaskRepo};

#[derive(Debug)]
pub enum WorkerExit {
    /// Cooperative cancellation — exit code 0, no restart needed.
    Shutdown,
    /// `ClaimNext` found nothing left for this group/run — exit code 0.
    NoMoreWork,
    /// Configuration-level failure (no proxy, repeated launch failure) —
    /// exit code "configuration error", never restarted.
    Fatal(String),
    /// `account_frozen` — exit code 3, Supervisor must not restart.
    DoNotRestart,
    /// Any other error surfaced mid-loop — exit code 1, restart-eligible.
    Transient(String),
}

pub struct WorkerContext<TR, PX, MR, PR, D>
where
    TR: TaskRepo,
    PX: ProxyRepo,
    MR: MessageRepo,
    PR: ProfileRepo,
    D: Driver,
{
    pub queue: Arc<TaskQueue<TR>>,
    pub proxies: Arc<ProxyRegistry<PX>>,
    pub messages: Arc<MR>,
    pub profiles: Arc<PR>,
    pub driver: Arc<D>,
    pub classifier: ClassifierConfig,
    pub rate: RateConfig,
    pub timeouts: TimeoutConfig,
    pub clock: SharedClock,
}

const MAX_LAUNCH_ATTEMPTS: u32 = 3;

/// Sleeps for `duration`, waking early (and returning `false`) if `cancel`
/// fires first. Used by both CLAIMING's rate-limit backoff and PACING.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

#[instrument(skip_all, fields(profile_id = %profile.profile_id, group_id = %group_id, run_id = %run_id))]
pub async fn run_worker<TR, PX, MR, PR, D>(
    ctx: Arc<WorkerContext<TR, PX, MR, PR, D>>,
    profile: Profile,
    group_id: GroupId,
    run_id: RunId,
    cancel: CancellationToken,
) -> WorkerExit
where
    TR: TaskRepo + 'static,
    PX: ProxyRepo + 'static,
    MR: MessageRepo + 'static,
    PR: ProfileRepo + 'static,
    D: Driver + 'static,
{
    // RESOLVE_PROXY
    let proxy_url = match ctx.proxies.resolve(profile.profile_id).await {
        Ok(url) => url,
        Err(err) => {
            error!(%err, "no proxy available, worker cannot start");
            return WorkerExit::Fatal(format!("proxy resolution failed: {err}"));
        }
    };

    // LAUNCH, bounded retry with exponential backoff.
    let mut session = None;
    for attempt in 1..=MAX_LAUNCH_ATTEMPTS {
        match ctx.driver.open(&profile, &proxy_url).await {
            Ok(s) => {
                session = Some(s);
                break;
            }
            Err(err) => {
                warn!(%err, attempt, "driver open failed");
                if attempt == MAX_LAUNCH_ATTEMPTS {
                    return WorkerExit::Fatal(format!("launch failed after {attempt} attempts: {err}"));
                }
                let backoff = Duration::from_millis(200 * 2u64.pow(attempt));
                if !sleep_cancellable(backoff, &cancel).await {
                    return WorkerExit::Shutdown;
                }
            }
        }
    }
    let session = session.expect("loop above always assigns session or returns");

    let mut failed_since_success: u32 = 0;

    let exit = 'outer: loop {
        if cancel.is_cancelled() {
            break 'outer WorkerExit::Shutdown;
        }

        // CLAIMING
        let claim = tokio::select! {
            _ = cancel.cancelled() => break 'outer WorkerExit::Shutdown,
            res = ctx.queue.claim_next(group_id, profile.profile_id, run_id, ctx.rate.max_messages_per_hour) => res,
        };

        let task = match claim {
            Ok(ClaimOutcome::Claimed(task)) => task,
            Ok(ClaimOutcome::RateLimited) => {
                let delay = rate::jittered(
                    rate::hourly_pace_delay(ctx.rate.max_messages_per_hour),
                    ctx.rate.delay_randomness,
                    &mut rng(),
                );
                if !sleep_cancellable(delay, &cancel).await {
                    break 'outer WorkerExit::Shutdown;
                }
                continue;
            }
            Ok(ClaimOutcome::NoTask) => break 'outer WorkerExit::NoMoreWork,
            Err(err) => break 'outer WorkerExit::Transient(err.to_string()),
        };

        // SENDING: pick a message, then drive the external SendAction under
        // the combined timeout budget.
        let message = match ctx.messages.pick_random_active(group_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                let _ = ctx.queue.release(task.id, None).await;
                break 'outer WorkerExit::NoMoreWork;
            }
            Err(err) => break 'outer WorkerExit::Transient(err.to_string()),
        };

        let cycle_number = task.completed_cycles + 1;
        let budget = ctx.timeouts.total_send_budget();
        let outcome = match tokio::time::timeout(
            budget,
            ctx.driver.send_action(&session, &task.chat_ref, &message.text),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                warn!(%err, "send_action failed");
                Outcome::NetworkError
            }
            Err(_) => {
                warn!("send_action timed out after {:?}", budget);
                Outcome::Timeout
            }
        };

        // RECORDING
        let classification = ErrorClassifier::classify(&outcome, failed_since_success, &ctx.classifier);
        let error_kind = outcome.error_kind();

        if let Err(err) = apply_classification(
            &ctx,
            &task,
            &profile,
            run_id,
            cycle_number,
            &message,
            &proxy_url,
            &classification,
            error_kind,
        )
        .await
        {
            break 'outer WorkerExit::Transient(err);
        }

        match &classification.task {
            TaskAction::AdvanceCycle => failed_since_success = 0,
            TaskAction::Block { .. } => failed_since_success = 0,
            _ => failed_since_success += 1,
        }

        if classification.worker == WorkerDirective::ExitDoNotRestart {
            break 'outer WorkerExit::DoNotRestart;
        }

        let _ = ctx.profiles.record_heartbeat(profile.profile_id).await;

        // PACING
        let pacing_delay = rate::jittered(
            rate::hourly_pace_delay(ctx.rate.max_messages_per_hour),
            ctx.rate.delay_randomness,
            &mut rng(),
        );
        if !sleep_cancellable(pacing_delay, &cancel).await {
            break 'outer WorkerExit::Shutdown;
        }
    };

    ctx.driver.close(session).await;
    info!(?exit, "worker exiting");
    exit
}

#[allow(clippy::too_many_arguments)]
async fn apply_classification<TR, PX, MR, PR, D>(
    ctx: &WorkerContext<TR, PX, MR, PR, D>,
    task: &crate::model::Task,
    profile: &Profile,
    run_id: RunId,
    cycle_number: i32,
    message: &crate::model::Message,
    proxy_url: &str,
    classification: &Classification,
    error_kind: Option<&'static str>,
) -> Result<(), String>
where
    TR: TaskRepo,
    PX: ProxyRepo,
    MR: MessageRepo,
    PR: ProfileRepo,
    D: Driver,
{
    match &classification.task {
        TaskAction::AdvanceCycle => {
            ctx.queue
                .record_success(task.id, profile.profile_id, run_id, cycle_number, &message.text, &ctx.rate)
                .await
                .map_err(|e| e.to_string())?;
            let _ = ctx.messages.record_usage(message.id).await;
        }
        TaskAction::RecordFailedNoAdvance { after } => {
            let next_available_at = Some(ctx.clock.now() + chrono::Duration::from_std(*after).unwrap_or_default());
            ctx.queue
                .record_failure(
                    task.id,
                    profile.profile_id,
                    run_id,
                    cycle_number,
                    error_kind.unwrap_or("unexpected_error"),
                    None,
                    next_available_at,
                )
                .await
                .map_err(|e| e.to_string())?;
        }
        TaskAction::Block { reason } => {
            ctx.queue
                .record_failure(
                    task.id,
                    profile.profile_id,
                    run_id,
                    cycle_number,
                    error_kind.unwrap_or("unexpected_error"),
                    Some(*reason),
                    None,
                )
                .await
                .map_err(|e| e.to_string())?;
        }
        TaskAction::ReleaseNoBlock => {
            ctx.queue.release(task.id, None).await.map_err(|e| e.to_string())?;
        }
        TaskAction::ReleaseWithDelay { after } => {
            let next_available_at = Some(ctx.clock.now() + chrono::Duration::from_std(*after).unwrap_or_default());
            ctx.queue
                .release(task.id, next_available_at)
                .await
                .map_err(|e| e.to_string())?;
        }
    }

    match classification.profile {
        ProfileAction::None => {}
        ProfileAction::IncrementCounters => {}
        ProfileAction::BlockAndDeactivate => {
            ctx.profiles
                .block_and_deactivate(profile.profile_id)
                .await
                .map_err(|e| e.to_string())?;
        }
    }

    match classification.proxy {
        ProxyAction::None => {}
        ProxyAction::RecordSuccess => {
            ctx.proxies
                .observe_outcome(proxy_url, profile.profile_id, false, true)
                .await
                .map_err(|e| e.to_string())?;
        }
        ProxyAction::RecordChatNotFound => {
            ctx.proxies
                .observe_outcome(proxy_url, profile.profile_id, true, false)
                .await
                .map_err(|e| e.to_string())?;
        }
        ProxyAction::RecordOtherError => {
            ctx.proxies
                .observe_outcome(proxy_url, profile.profile_id, false, false)
                .await
                .map_err(|e| e.to_string())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::config::{ClassifierConfig, ProxyPolicyConfig, RateConfig, TimeoutConfig};
    use crate::driver::scripted::ScriptedDriver;
    use crate::error::RepoError;
    use crate::model::{Message, MessageId, ProfileId, Task, TaskId, TaskStatus};
    use crate::proxy_registry::ProxyRegistry;
    use crate::queue::TaskQueue;
    use crate::repo::{MessageRepo, ProfileRepo, ProxyRepo, RecordFailureOutcome, RecordSuccessOutcome, TaskRepo};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    /// One-task in-memory `TaskRepo`: claims it exactly once, then reports
    /// `NoTask` forever after, mirroring a single-chat group at `total_cycles = 1`.
    struct SingleTaskRepo {
        task: StdMutex<Option<Task>>,
        recorded_success: StdMutex<bool>,
        recorded_failure: StdMutex<Option<String>>,
    }

    impl SingleTaskRepo {
        fn new(task: Task) -> Self {
            Self {
                task: StdMutex::new(Some(task)),
                recorded_success: StdMutex::new(false),
                recorded_failure: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl TaskRepo for SingleTaskRepo {
        async fn claim_next(
            &self,
            _group_id: GroupId,
            profile_id: ProfileId,
            _run_id: RunId,
            _max_messages_per_hour: u32,
        ) -> Result<ClaimOutcome, RepoError> {
            let mut guard = self.task.lock().unwrap();
            match guard.take() {
                Some(mut task) => {
                    task.status = TaskStatus::InProgress;
                    task.assigned_profile_id = Some(profile_id);
                    Ok(ClaimOutcome::Claimed(task))
                }
                None => Ok(ClaimOutcome::NoTask),
            }
        }

        async fn record_success(
            &self,
            _task_id: TaskId,
            _profile_id: ProfileId,
            _run_id: RunId,
            _cycle_number: i32,
            _message_text: &str,
            _cycle_delay: chrono::Duration,
        ) -> Result<RecordSuccessOutcome, RepoError> {
            *self.recorded_success.lock().unwrap() = true;
            Ok(RecordSuccessOutcome { task_completed: true })
        }

        async fn record_failure(
            &self,
            _task_id: TaskId,
            _profile_id: ProfileId,
            _run_id: RunId,
            _cycle_number: i32,
            error_kind: &str,
            block_reason: Option<&str>,
            _next_available_at: Option<chrono::DateTime<Utc>>,
        ) -> Result<RecordFailureOutcome, RepoError> {
            *self.recorded_failure.lock().unwrap() = Some(error_kind.to_string());
            Ok(RecordFailureOutcome {
                task_blocked: block_reason.is_some(),
            })
        }

        async fn release(&self, _task_id: TaskId, _next_available_at: Option<chrono::DateTime<Utc>>) -> Result<(), RepoError> {
            Ok(())
        }

        async fn reset_stale(&self, _max_age: chrono::Duration) -> Result<u64, RepoError> {
            Ok(0)
        }

        async fn attempts_in_run(&self, _task_id: TaskId, _run_id: RunId) -> Result<i64, RepoError> {
            Ok(1)
        }
    }

    struct SingleProxyRepo {
        assigned: StdMutex<Option<ProfileId>>,
    }

    #[async_trait]
    impl ProxyRepo for SingleProxyRepo {
        async fn get_for_profile(&self, profile_id: ProfileId) -> Result<Option<crate::model::ProxyAssignment>, RepoError> {
            if *self.assigned.lock().unwrap() == Some(profile_id) {
                Ok(Some(assignment()))
            } else {
                Ok(None)
            }
        }

        async fn claim_unassigned(&self, profile_id: ProfileId) -> Result<Option<crate::model::ProxyAssignment>, RepoError> {
            *self.assigned.lock().unwrap() = Some(profile_id);
            Ok(Some(assignment()))
        }

        async fn rotate(&self, profile_id: ProfileId) -> Result<Option<crate::model::ProxyAssignment>, RepoError> {
            *self.assigned.lock().unwrap() = Some(profile_id);
            Ok(Some(assignment()))
        }

        async fn mark_unhealthy(&self, _proxy_url: &str) -> Result<(), RepoError> {
            Ok(())
        }

        async fn release(&self, _profile_id: ProfileId) -> Result<(), RepoError> {
            *self.assigned.lock().unwrap() = None;
            Ok(())
        }

        async fn observe_outcome(
            &self,
            proxy_url: &str,
            profile_id: ProfileId,
            chat_not_found: bool,
            success: bool,
        ) -> Result<crate::model::ProxyStats, RepoError> {
            Ok(crate::model::ProxyStats {
                proxy_url: proxy_url.to_string(),
                profile_id,
                total_attempts: 1,
                successful_sends: success as i64,
                chat_not_found_count: chat_not_found as i64,
                other_errors: 0,
                period_start: Utc::now(),
                last_attempt_at: Some(Utc::now()),
            })
        }
    }

    fn assignment() -> crate::model::ProxyAssignment {
        crate::model::ProxyAssignment {
            proxy_url: "proxy://only-one".to_string(),
            profile_id: None,
            is_healthy: true,
            assigned_at: None,
            last_rotation_at: None,
        }
    }

    struct OneMessageRepo;

    #[async_trait]
    impl MessageRepo for OneMessageRepo {
        async fn pick_random_active(&self, group_id: GroupId) -> Result<Option<Message>, RepoError> {
            Ok(Some(Message {
                id: MessageId(Uuid::new_v4()),
                group_id,
                text: "hello".to_string(),
                is_active: true,
                usage_count: 0,
            }))
        }

        async fn record_usage(&self, _message_id: MessageId) -> Result<(), RepoError> {
            Ok(())
        }
    }

    struct RecordingProfileRepo {
        blocked_and_deactivated: StdMutex<bool>,
    }

    #[async_trait]
    impl ProfileRepo for RecordingProfileRepo {
        async fn get(&self, profile_id: ProfileId) -> Result<Profile, RepoError> {
            Ok(profile(profile_id))
        }

        async fn list_eligible(&self) -> Result<Vec<Profile>, RepoError> {
            Ok(vec![])
        }

        async fn mark_blocked(&self, _profile_id: ProfileId, _blocked: bool) -> Result<(), RepoError> {
            Ok(())
        }

        async fn mark_logged_out(&self, _profile_id: ProfileId, _logged_out: bool) -> Result<(), RepoError> {
            Ok(())
        }

        async fn block_and_deactivate(&self, _profile_id: ProfileId) -> Result<(), RepoError> {
            *self.blocked_and_deactivated.lock().unwrap() = true;
            Ok(())
        }

        async fn record_heartbeat(&self, _profile_id: ProfileId) -> Result<(), RepoError> {
            Ok(())
        }
    }

    fn profile(profile_id: ProfileId) -> Profile {
        Profile {
            profile_id,
            name: "test".to_string(),
            is_active: true,
            is_blocked: false,
            is_logged_out: false,
            messages_sent_current_hour: 0,
            hour_window_start: Utc::now(),
            last_message_at: None,
            last_heartbeat_at: None,
        }
    }

    fn task(id: i64) -> Task {
        Task {
            id: TaskId(id),
            group_id: GroupId(Uuid::new_v4()),
            chat_ref: "chat-1".to_string(),
            status: TaskStatus::Pending,
            assigned_profile_id: None,
            total_cycles: 1,
            completed_cycles: 0,
            success_count: 0,
            failed_count: 0,
            is_blocked: false,
            block_reason: None,
            last_attempt_at: None,
            next_available_at: None,
        }
    }

    fn context(
        task_repo: Arc<SingleTaskRepo>,
        proxy_repo: SingleProxyRepo,
        profile_repo: RecordingProfileRepo,
        driver: ScriptedDriver,
    ) -> Arc<WorkerContext<SingleTaskRepo, SingleProxyRepo, OneMessageRepo, RecordingProfileRepo, ScriptedDriver>> {
        Arc::new(WorkerContext {
            queue: Arc::new(TaskQueue::new(task_repo)),
            proxies: Arc::new(ProxyRegistry::new(Arc::new(proxy_repo), ProxyPolicyConfig::default())),
            messages: Arc::new(OneMessageRepo),
            profiles: Arc::new(profile_repo),
            driver: Arc::new(driver),
            classifier: ClassifierConfig::default(),
            rate: RateConfig {
                max_messages_per_hour: 0,
                max_cycles: 1,
                delay_randomness: 0.0,
                cycle_delay: Duration::from_millis(1),
            },
            timeouts: TimeoutConfig {
                page_load_timeout: Duration::from_millis(10),
                search_timeout: Duration::from_millis(10),
                send_timeout: Duration::from_millis(10),
                shutdown_grace: Duration::from_millis(10),
                stale_claim_grace: Duration::from_secs(60),
            },
            clock: Arc::new(TestClock::new(Utc::now())),
        })
    }

    /// S1: a single-chat group drains to `NoMoreWork` after one successful send.
    #[tokio::test]
    async fn single_task_run_advances_cycle_and_exits_no_more_work() {
        let task_repo = Arc::new(SingleTaskRepo::new(task(1)));
        let ctx = context(
            task_repo.clone(),
            SingleProxyRepo { assigned: StdMutex::new(None) },
            RecordingProfileRepo { blocked_and_deactivated: StdMutex::new(false) },
            ScriptedDriver::always_success(1),
        );
        let profile_id = ProfileId(Uuid::new_v4());
        let exit = run_worker(
            ctx.clone(),
            profile(profile_id),
            GroupId(Uuid::new_v4()),
            RunId::new(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(exit, WorkerExit::NoMoreWork));
        assert!(*task_repo.recorded_success.lock().unwrap());
    }

    /// S6: `account_frozen` blocks+deactivates the profile and the worker
    /// exits do-not-restart rather than being retried by the Supervisor.
    #[tokio::test]
    async fn account_frozen_blocks_profile_and_exits_do_not_restart() {
        let driver = ScriptedDriver::new(vec![Ok(())], vec![Outcome::AccountFrozen]);
        let profile_repo = RecordingProfileRepo { blocked_and_deactivated: StdMutex::new(false) };
        let ctx = context(
            Arc::new(SingleTaskRepo::new(task(1))),
            SingleProxyRepo { assigned: StdMutex::new(None) },
            profile_repo,
            driver,
        );
        let profile_id = ProfileId(Uuid::new_v4());
        let exit = run_worker(
            ctx.clone(),
            profile(profile_id),
            GroupId(Uuid::new_v4()),
            RunId::new(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(exit, WorkerExit::DoNotRestart));
        assert!(*ctx.profiles.blocked_and_deactivated.lock().unwrap());
    }
}
