//! Task entity and lifecycle state machine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Awaiting coordinator approval before anything is spawned.
    Proposed,
    Pending,
    Running,
    Paused,
    NeedsInput,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether a transition from this status to `target` is legal.
    ///
    /// Terminal statuses transition back to `Running` only through the
    /// resume path, which starts a fresh controller pair.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Proposed, Pending)
                | (Proposed, Cancelled)
                | (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, NeedsInput)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, NeedsInput)
                | (Paused, Cancelled)
                | (NeedsInput, Running)
                | (NeedsInput, Failed)
                | (NeedsInput, Cancelled)
                | (Completed, Running)
                | (Failed, Running)
                | (Cancelled, Running)
        )
    }

    /// Completed, failed and cancelled tasks have no live controllers.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses a watchdog or recovery pass cares about.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Paused | TaskStatus::NeedsInput
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Proposed => "proposed",
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::NeedsInput => "needs_input",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "proposed" => Ok(TaskStatus::Proposed),
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "needs_input" => Ok(TaskStatus::NeedsInput),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Where the watchdog stands with this task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchdogState {
    None,
    Warned,
    Restarted,
    GaveUp,
}

impl WatchdogState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchdogState::None => "none",
            WatchdogState::Warned => "warned",
            WatchdogState::Restarted => "restarted",
            WatchdogState::GaveUp => "gave_up",
        }
    }
}

impl fmt::Display for WatchdogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WatchdogState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(WatchdogState::None),
            "warned" => Ok(WatchdogState::Warned),
            "restarted" => Ok(WatchdogState::Restarted),
            "gave_up" => Ok(WatchdogState::GaveUp),
            other => Err(format!("unknown watchdog state: {other}")),
        }
    }
}

/// One lifecycle event on a task's timeline.
///
/// The full timeline is the chronological merge of these events with the
/// task's mailbox messages, so the whole history is reconstructible from
/// the store alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub summary: String,
    pub detail: String,
}

impl TimelineEntry {
    pub fn new(event: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            event: event.into(),
            summary: summary.into(),
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// A long-running background task and all coordinator-visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    /// The goal handed to the worker session.
    pub task_prompt: String,
    /// Standing guidance for the supervisor's assessments.
    pub supervisor_instructions: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    pub worker_session_id: Option<String>,
    pub supervisor_session_id: Option<String>,

    /// Prompt delivered to the coordinator callback on terminal states.
    pub on_complete_hook: Option<String>,

    /// Supervisor wake cadence.
    pub check_interval: Duration,
    /// Whether a supervisor is started alongside the worker.
    pub supervise: bool,

    /// Last moment the worker showed signs of life.
    pub last_activity_at: DateTime<Utc>,
    /// Worker reports are rejected until an `input` answer is enqueued.
    pub awaiting_input: bool,

    /// A worker `completed` report is held here until the supervisor rules.
    pub completion_deferred: bool,
    pub completion_deferred_at: Option<DateTime<Utc>>,
    pub completion_deferred_summary: String,
    pub completion_deferred_detail: String,
    /// Assessments emitted since completion was deferred.
    pub supervisor_assessment_count: u32,

    pub worker_exited_at: Option<DateTime<Utc>>,
    /// Set by a supervisor `escalation`; cleared by any later signal.
    pub escalated_at: Option<DateTime<Utc>>,

    pub watchdog_state: WatchdogState,
    pub restart_count: u32,

    /// Reason recorded when the task entered `failed`.
    pub fail_reason: Option<String>,
}

impl Task {
    pub fn new(name: impl Into<String>, task_prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            task_prompt: task_prompt.into(),
            supervisor_instructions: String::new(),
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            worker_session_id: None,
            supervisor_session_id: None,
            on_complete_hook: None,
            check_interval: Duration::from_secs(120),
            supervise: true,
            last_activity_at: now,
            awaiting_input: false,
            completion_deferred: false,
            completion_deferred_at: None,
            completion_deferred_summary: String::new(),
            completion_deferred_detail: String::new(),
            supervisor_assessment_count: 0,
            worker_exited_at: None,
            escalated_at: None,
            watchdog_state: WatchdogState::None,
            restart_count: 0,
            fail_reason: None,
        }
    }

    /// Validated status change. Records `completed_at` on terminal entry.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.updated_at = Utc::now();
        if target.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    pub fn touch_activity(&mut self) {
        let now = Utc::now();
        self.last_activity_at = now;
        self.updated_at = now;
    }

    /// Stash a worker `completed` report while the supervisor deliberates.
    pub fn defer_completion(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.completion_deferred = true;
        self.completion_deferred_at = Some(Utc::now());
        self.completion_deferred_summary = summary.into();
        self.completion_deferred_detail = detail.into();
        self.supervisor_assessment_count = 0;
        self.updated_at = Utc::now();
    }

    pub fn clear_deferred(&mut self) {
        self.completion_deferred = false;
        self.completion_deferred_at = None;
        self.completion_deferred_summary.clear();
        self.completion_deferred_detail.clear();
        self.supervisor_assessment_count = 0;
    }
}
