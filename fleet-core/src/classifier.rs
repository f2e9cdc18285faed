//! `ErrorClassifier` (§4.4): a pure function from a `SendAction` `Outcome` to
//! a {task, profile, proxy, worker} action quadruple. No I/O; callers (the
//! Worker's RECORDING state) are responsible for executing the actions
//! against the Store in one transaction.

use std::time::Duration;

use crate::config::ClassifierConfig;

/// The tagged result of one `Driver::send_action` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    ChatNotFound,
    AccountFrozen,
    NeedToJoin,
    PremiumRequired,
    StarsRequired,
    UserBlocked,
    InputUnavailable,
    SlowMode { wait_seconds: u64 },
    NetworkError,
    SelectorMissing,
    Timeout,
    UnexpectedError,
}

impl Outcome {
    /// The `error_kind` persisted on the `TaskAttempt` row; `None` for
    /// `Success`, which has no error kind.
    pub fn error_kind(&self) -> Option<&'static str> {
        match self {
            Outcome::Success => None,
            Outcome::ChatNotFound => Some("chat_not_found"),
            Outcome::AccountFrozen => Some("account_frozen"),
            Outcome::NeedToJoin => Some("need_to_join"),
            Outcome::PremiumRequired => Some("premium_required"),
            Outcome::StarsRequired => Some("stars_required"),
            Outcome::UserBlocked => Some("user_blocked"),
            Outcome::InputUnavailable => Some("input_unavailable"),
            Outcome::SlowMode { .. } => Some("slow_mode"),
            Outcome::NetworkError => Some("network_error"),
            Outcome::SelectorMissing => Some("selector_missing"),
            Outcome::Timeout => Some("timeout"),
            Outcome::UnexpectedError => Some("unexpected_error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskAction {
    /// `completed_cycles += 1`, reschedule by the pacing delay computed by
    /// `rate::effective_cycle_delay`.
    AdvanceCycle,
    /// Record the failed attempt; leave `completed_cycles` untouched;
    /// reschedule after `after`.
    RecordFailedNoAdvance { after: Duration },
    /// Permanently block the task with the given reason; release the claim.
    Block { reason: &'static str },
    /// Release the claim without blocking; no reschedule beyond "now".
    ReleaseNoBlock,
    /// Release the claim and reschedule after `after` (`slow_mode`).
    ReleaseWithDelay { after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProfileAction {
    None,
    IncrementCounters,
    BlockAndDeactivate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProxyAction {
    None,
    RecordSuccess,
    RecordChatNotFound,
    RecordOtherError,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkerDirective {
    Continue,
    ExitDoNotRestart,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub task: TaskAction,
    pub profile: ProfileAction,
    pub proxy: ProxyAction,
    pub worker: WorkerDirective,
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    /// `failed_attempts_since_success` is the count of failed `TaskAttempt`
    /// rows for this task since its last success (or ever, if none) —
    /// supplied by the caller since the classifier does no I/O. Only
    /// transport-ish faults (network errors, timeouts, missing selectors,
    /// unexpected errors) escalate to a block past `max_attempts_before_block`;
    /// restricted-send outcomes always reschedule without advancing the cycle.
    pub fn classify(
        outcome: &Outcome,
        failed_attempts_since_success: u32,
        config: &ClassifierConfig,
    ) -> Classification {
        match outcome {
            Outcome::Success => Classification {
                task: TaskAction::AdvanceCycle,
                profile: ProfileAction::IncrementCounters,
                proxy: ProxyAction::RecordSuccess,
                worker: WorkerDirective::Continue,
            },
            Outcome::ChatNotFound => Classification {
                task: TaskAction::Block {
                    reason: "chat_not_found",
                },
                profile: ProfileAction::None,
                proxy: ProxyAction::RecordChatNotFound,
                worker: WorkerDirective::Continue,
            },
            Outcome::AccountFrozen => Classification {
                task: TaskAction::ReleaseNoBlock,
                profile: ProfileAction::BlockAndDeactivate,
                proxy: ProxyAction::None,
                worker: WorkerDirective::ExitDoNotRestart,
            },
            Outcome::NeedToJoin
            | Outcome::PremiumRequired
            | Outcome::StarsRequired
            | Outcome::UserBlocked
            | Outcome::InputUnavailable => Self::classify_restricted_send(),
            Outcome::SlowMode { wait_seconds } => Classification {
                task: TaskAction::ReleaseWithDelay {
                    after: Duration::from_secs(*wait_seconds),
                },
                profile: ProfileAction::None,
                proxy: ProxyAction::None,
                worker: WorkerDirective::Continue,
            },
            Outcome::NetworkError | Outcome::Timeout | Outcome::SelectorMissing => {
                let mut classification = Self::classify_countable_failure(
                    failed_attempts_since_success,
                    config,
                    "too_many_failures",
                );
                classification.proxy = ProxyAction::RecordOtherError;
                classification
            }
            Outcome::UnexpectedError => {
                let mut classification = Self::classify_countable_failure(
                    failed_attempts_since_success,
                    config,
                    "too_many_failures",
                );
                classification.proxy = ProxyAction::RecordOtherError;
                classification
            }
        }
    }

    /// Restricted-send outcomes (`need_to_join`, `premium_required`, ...) never
    /// block the task; the send may succeed on a later cycle or once the
    /// destination's membership requirements change, so the task just stays
    /// eligible and gets retried.
    fn classify_restricted_send() -> Classification {
        Classification {
            task: TaskAction::RecordFailedNoAdvance {
                after: Duration::ZERO,
            },
            profile: ProfileAction::None,
            proxy: ProxyAction::None,
            worker: WorkerDirective::Continue,
        }
    }

    fn classify_countable_failure(
        failed_attempts_since_success: u32,
        config: &ClassifierConfig,
        block_reason: &'static str,
    ) -> Classification {
        let task = if failed_attempts_since_success + 1 >= config.max_attempts_before_block {
            TaskAction::Block {
                reason: block_reason,
            }
        } else {
            TaskAction::RecordFailedNoAdvance {
                after: Duration::ZERO,
            }
        };
        Classification {
            task,
            profile: ProfileAction::None,
            proxy: ProxyAction::None,
            worker: WorkerDirective::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts_before_block: u32) -> ClassifierConfig {
        ClassifierConfig {
            max_attempts_before_block,
        }
    }

    #[test]
    fn success_advances_cycle_and_records_proxy_success() {
        let c = ErrorClassifier::classify(&Outcome::Success, 0, &config(5));
        assert_eq!(c.task, TaskAction::AdvanceCycle);
        assert_eq!(c.proxy, ProxyAction::RecordSuccess);
        assert_eq!(c.worker, WorkerDirective::Continue);
    }

    #[test]
    fn chat_not_found_blocks_task_without_touching_profile() {
        let c = ErrorClassifier::classify(&Outcome::ChatNotFound, 0, &config(5));
        assert_eq!(
            c.task,
            TaskAction::Block {
                reason: "chat_not_found"
            }
        );
        assert_eq!(c.profile, ProfileAction::None);
        assert_eq!(c.proxy, ProxyAction::RecordChatNotFound);
    }

    #[test]
    fn account_frozen_exits_do_not_restart() {
        let c = ErrorClassifier::classify(&Outcome::AccountFrozen, 0, &config(5));
        assert_eq!(c.task, TaskAction::ReleaseNoBlock);
        assert_eq!(c.profile, ProfileAction::BlockAndDeactivate);
        assert_eq!(c.worker, WorkerDirective::ExitDoNotRestart);
    }

    #[test]
    fn restricted_send_never_blocks_even_past_threshold() {
        let c = ErrorClassifier::classify(&Outcome::NeedToJoin, 4, &config(5));
        assert!(matches!(c.task, TaskAction::RecordFailedNoAdvance { .. }));
    }

    #[test]
    fn restricted_send_below_threshold_reschedules_without_advancing() {
        let c = ErrorClassifier::classify(&Outcome::PremiumRequired, 1, &config(5));
        assert!(matches!(c.task, TaskAction::RecordFailedNoAdvance { .. }));
    }

    #[test]
    fn slow_mode_releases_with_delay() {
        let c = ErrorClassifier::classify(&Outcome::SlowMode { wait_seconds: 30 }, 0, &config(5));
        assert_eq!(
            c.task,
            TaskAction::ReleaseWithDelay {
                after: Duration::from_secs(30)
            }
        );
    }

    #[test]
    fn transport_faults_record_other_error_on_proxy() {
        let c = ErrorClassifier::classify(&Outcome::NetworkError, 0, &config(5));
        assert_eq!(c.proxy, ProxyAction::RecordOtherError);
    }

    #[test]
    fn unexpected_error_is_the_catch_all_for_unclassifiable_driver_faults() {
        let c = ErrorClassifier::classify(&Outcome::UnexpectedError, 4, &config(5));
        assert_eq!(
            c.task,
            TaskAction::Block {
                reason: "too_many_failures"
            }
        );
    }
}
