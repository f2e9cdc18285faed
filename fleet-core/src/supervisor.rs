//! Supervisor (§4.6): lifecycle of N Workers under one `RunSession`. Workers
//! are isolated `tokio::task`s tracked in a `JoinSet`; restart policy is
//! exponential backoff per profile; shutdown is cooperative via a shared
//! `CancellationToken`, the same primitive the teacher's own supervised
//! services use for crash detection vs. clean stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::driver::Driver;
use crate::error::RepoError;
use crate::model::{GroupId, Profile, ProfileId, RunId};
use crate::repo::{MessageRepo, ProfileRepo, ProxyRepo, TaskRepo};
use crate::worker::{run_worker, WorkerContext, WorkerExit};

/// Per-profile restart bookkeeping, the `{k, next_allowed_restart_at,
/// do_not_restart}` triple from §9 "Subprocess supervision".
#[derive(Debug, Clone, Default)]
struct RestartState {
    k: u32,
    do_not_restart: bool,
}

#[derive(Debug, Default)]
pub struct SupervisorReport {
    pub run_id: Option<RunId>,
    pub workers_started: usize,
    pub permanently_stopped: Vec<ProfileId>,
}

pub struct Supervisor<TR, PX, MR, PR, D>
where
    TR: TaskRepo,
    PX: ProxyRepo,
    MR: MessageRepo,
    PR: ProfileRepo,
    D: Driver,
{
    ctx: Arc<WorkerContext<TR, PX, MR, PR, D>>,
    config: SupervisorConfig,
    cancel: CancellationToken,
}

impl<TR, PX, MR, PR, D> Supervisor<TR, PX, MR, PR, D>
where
    TR: TaskRepo + 'static,
    PX: ProxyRepo + 'static,
    MR: MessageRepo + 'static,
    PR: ProfileRepo + 'static,
    D: Driver + 'static,
{
    pub fn new(ctx: Arc<WorkerContext<TR, PX, MR, PR, D>>, config: SupervisorConfig) -> Self {
        Self {
            ctx,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// The token `stop()` (§4.10) cancels to request graceful shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// §4.6 `Start(group, worker_count)`.
    pub async fn run(
        &self,
        group_id: GroupId,
        worker_count: usize,
        stale_claim_grace: ChronoDuration,
    ) -> Result<SupervisorReport, RepoError> {
        let run_id = RunId::new();
        info!(%run_id, %group_id, worker_count, "supervisor starting run");

        let reset = self.ctx.queue.reset_stale(stale_claim_grace).await?;
        if reset > 0 {
            info!(reset, "reclaimed stale in-progress tasks at startup");
        }

        let eligible = self.ctx.profiles.list_eligible().await?;
        let chosen: Vec<Profile> = eligible.into_iter().take(worker_count).collect();
        if chosen.len() < worker_count {
            warn!(
                wanted = worker_count,
                available = chosen.len(),
                "fewer eligible profiles than requested workers"
            );
        }

        let mut profiles_by_id: HashMap<ProfileId, Profile> = HashMap::new();
        let mut restart_state: HashMap<ProfileId, RestartState> = HashMap::new();
        let mut join_set: JoinSet<(ProfileId, WorkerExit)> = JoinSet::new();
        let (restart_tx, mut restart_rx) = mpsc::unbounded_channel::<ProfileId>();
        let mut pending_restarts: usize = 0;
        let mut permanently_stopped = Vec::new();

        for profile in chosen.iter().cloned() {
            let profile_id = profile.profile_id;
            profiles_by_id.insert(profile_id, profile.clone());
            restart_state.insert(profile_id, RestartState::default());
            self.spawn_worker(&mut join_set, profile, group_id, run_id);
        }

        let workers_started = chosen.len();

        loop {
            if join_set.is_empty() && pending_restarts == 0 {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !join_set.is_empty() => {
                    info!("shutdown requested, waiting for workers to drain");
                    let grace = self.ctx.timeouts.shutdown_grace;
                    let drained = tokio::time::timeout(grace, async {
                        while join_set.join_next().await.is_some() {}
                    }).await;
                    if drained.is_err() {
                        warn!("shutdown grace period elapsed, aborting remaining workers");
                        join_set.shutdown().await;
                    }
                    let reset = self.ctx.queue.reset_stale(ChronoDuration::zero()).await?;
                    if reset > 0 {
                        info!(reset, "released tasks still claimed at shutdown");
                    }
                    break;
                }

                Some(joined) = join_set.join_next() => {
                    let (profile_id, exit) = match joined {
                        Ok(pair) => pair,
                        Err(join_err) => {
                            warn!(%join_err, "worker task panicked");
                            continue;
                        }
                    };
                    self.handle_exit(
                        profile_id,
                        exit,
                        &mut restart_state,
                        &mut permanently_stopped,
                        &mut pending_restarts,
                        restart_tx.clone(),
                    );
                }

                Some(profile_id) = restart_rx.recv() => {
                    pending_restarts -= 1;
                    if self.cancel.is_cancelled() {
                        continue;
                    }
                    if let Some(profile) = profiles_by_id.get(&profile_id).cloned() {
                        self.spawn_worker(&mut join_set, profile, group_id, run_id);
                    }
                }
            }
        }

        Ok(SupervisorReport {
            run_id: Some(run_id),
            workers_started,
            permanently_stopped,
        })
    }

    fn spawn_worker(
        &self,
        join_set: &mut JoinSet<(ProfileId, WorkerExit)>,
        profile: Profile,
        group_id: GroupId,
        run_id: RunId,
    ) {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let profile_id = profile.profile_id;
        join_set.spawn(async move {
            let exit = run_worker(ctx, profile, group_id, run_id, cancel).await;
            (profile_id, exit)
        });
    }

    fn handle_exit(
        &self,
        profile_id: ProfileId,
        exit: WorkerExit,
        restart_state: &mut HashMap<ProfileId, RestartState>,
        permanently_stopped: &mut Vec<ProfileId>,
        pending_restarts: &mut usize,
        restart_tx: mpsc::UnboundedSender<ProfileId>,
    ) {
        match exit {
            WorkerExit::Shutdown | WorkerExit::NoMoreWork => {
                info!(%profile_id, ?exit, "worker stopped, no restart needed");
                if let Some(state) = restart_state.get_mut(&profile_id) {
                    state.k = 0;
                }
            }
            WorkerExit::DoNotRestart | WorkerExit::Fatal(_) => {
                warn!(%profile_id, ?exit, "worker stopped permanently");
                if let Some(state) = restart_state.get_mut(&profile_id) {
                    state.do_not_restart = true;
                }
                permanently_stopped.push(profile_id);
            }
            WorkerExit::Transient(reason) => {
                let state = restart_state.entry(profile_id).or_default();
                if state.do_not_restart {
                    permanently_stopped.push(profile_id);
                    return;
                }
                state.k += 1;
                let backoff = backoff_for(state.k, &self.config);
                warn!(%profile_id, reason, k = state.k, ?backoff, "worker exited transiently, scheduling restart");
                *pending_restarts += 1;
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = restart_tx.send(profile_id);
                });
            }
        }
    }
}

fn backoff_for(k: u32, config: &SupervisorConfig) -> Duration {
    let base = config.restart_backoff_base;
    let scaled = base.saturating_mul(1u32.checked_shl(k.min(31)).unwrap_or(u32::MAX));
    scaled.min(config.restart_backoff_cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_up_to_the_cap() {
        let config = SupervisorConfig {
            restart_backoff_base: Duration::from_secs(1),
            restart_backoff_cap: Duration::from_secs(10),
        };
        assert_eq!(backoff_for(0, &config), Duration::from_secs(1));
        assert_eq!(backoff_for(1, &config), Duration::from_secs(2));
        assert_eq!(backoff_for(2, &config), Duration::from_secs(4));
        assert_eq!(backoff_for(10, &config), Duration::from_secs(10));
    }
}
