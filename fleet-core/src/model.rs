//! Domain types for SPEC_FULL.md §3. Storage representation is owned by the
//! `repo` module; these are the shapes callers outside `repo` actually work
//! with.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub profile_id: ProfileId,
    pub name: String,
    pub is_active: bool,
    pub is_blocked: bool,
    pub is_logged_out: bool,
    pub messages_sent_current_hour: i32,
    pub hour_window_start: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Profile {
    /// Whether a profile is a legal claim target, per the `is_blocked ⇒ ¬is_active` invariant.
    pub fn is_eligible(&self) -> bool {
        self.is_active && !self.is_blocked && !self.is_logged_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub group_id: GroupId,
    pub chat_ref: String,
    pub status: TaskStatus,
    pub assigned_profile_id: Option<ProfileId>,
    pub total_cycles: i32,
    pub completed_cycles: i32,
    pub success_count: i32,
    pub failed_count: i32,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_available_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskAttempt {
    pub task_id: TaskId,
    pub profile_id: ProfileId,
    pub run_id: RunId,
    pub cycle_number: i32,
    pub status: AttemptStatus,
    pub error_kind: Option<String>,
    pub message_text: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub group_id: GroupId,
    pub text: String,
    pub is_active: bool,
    pub usage_count: i64,
}

#[derive(Debug, Clone)]
pub struct ProxyAssignment {
    pub proxy_url: String,
    pub profile_id: Option<ProfileId>,
    pub is_healthy: bool,
    pub assigned_at: Option<DateTime<Utc>>,
    pub last_rotation_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ProxyStats {
    pub proxy_url: String,
    pub profile_id: ProfileId,
    pub total_attempts: i64,
    pub successful_sends: i64,
    pub chat_not_found_count: i64,
    pub other_errors: i64,
    pub period_start: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl ProxyStats {
    /// `ObserveOutcome`'s rotation trigger, §4.3: ratio of `chat_not_found` within the
    /// window, gated by a minimum sample size so a single early failure can't trip it.
    pub fn chat_not_found_ratio(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.chat_not_found_count as f64 / self.total_attempts as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileDailyStats {
    pub profile_id: ProfileId,
    pub date: NaiveDate,
    pub messages_sent: i64,
    pub successful_sends: i64,
    pub failed_sends: i64,
}
