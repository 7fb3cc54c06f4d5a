//! Scheduled job model and cron helpers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// When a job fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// One-shot at an absolute time.
    At(DateTime<Utc>),
    /// Recurring, standard 5-field cron expression.
    Cron(String),
}

impl Schedule {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Schedule::At(_) => "at",
            Schedule::Cron(_) => "cron",
        }
    }

    pub fn expr_string(&self) -> String {
        match self {
            Schedule::At(ts) => ts.to_rfc3339(),
            Schedule::Cron(expr) => expr.clone(),
        }
    }

    /// Rebuild from the two DB columns.
    pub fn from_db(kind: &str, expr: &str) -> Result<Self, String> {
        match kind {
            "at" => DateTime::parse_from_rfc3339(expr)
                .map(|dt| Schedule::At(dt.with_timezone(&Utc)))
                .map_err(|e| format!("bad timestamp {expr}: {e}")),
            "cron" => Ok(Schedule::Cron(expr.to_string())),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }

    /// Reject malformed schedules before anything is persisted.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), JobError> {
        match self {
            Schedule::At(ts) => {
                if *ts <= now {
                    return Err(JobError::InvalidSchedule(format!(
                        "timestamp {ts} is in the past"
                    )));
                }
                Ok(())
            }
            Schedule::Cron(expr) => validate_cron(expr).map(|_| ()),
        }
    }

    /// Next firing strictly after `after`, or `None` when exhausted.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, JobError> {
        match self {
            Schedule::At(ts) => Ok(if *ts > after { Some(*ts) } else { None }),
            Schedule::Cron(expr) => {
                let schedule = validate_cron(expr)?;
                Ok(schedule.after(&after).next())
            }
        }
    }
}

/// Parse a 5-field cron expression.
///
/// The `cron` crate wants a leading seconds field, so a fixed `0` is
/// prepended before parsing.
pub fn validate_cron(expr: &str) -> Result<cron::Schedule, JobError> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(JobError::InvalidSchedule(format!(
            "expected 5 cron fields, got {fields}: {expr}"
        )));
    }
    cron::Schedule::from_str(&format!("0 {expr}"))
        .map_err(|e| JobError::InvalidSchedule(format!("{expr}: {e}")))
}

/// Lifecycle of a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Active,
    Cancelled,
    /// One-shot that has fired.
    Exhausted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "cancelled" => Ok(JobStatus::Cancelled),
            "exhausted" => Ok(JobStatus::Exhausted),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// What gets turned into a task when the job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub task_name: String,
    pub task_prompt: String,
    #[serde(default)]
    pub supervisor_instructions: String,
    #[serde(default)]
    pub check_interval_secs: Option<u64>,
    #[serde(default)]
    pub on_complete: Option<String>,
    #[serde(default = "default_supervise")]
    pub supervise: bool,
}

fn default_supervise() -> bool {
    true
}

impl JobPayload {
    pub fn new(task_name: impl Into<String>, task_prompt: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            task_prompt: task_prompt.into(),
            supervisor_instructions: String::new(),
            check_interval_secs: None,
            on_complete: None,
            supervise: true,
        }
    }
}

/// A persisted scheduled job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub schedule: Schedule,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// `None` once the schedule is exhausted.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: impl Into<String>, schedule: Schedule, payload: JobPayload) -> Self {
        let now = Utc::now();
        let next_run_at = match &schedule {
            Schedule::At(ts) => Some(*ts),
            Schedule::Cron(expr) => validate_cron(expr)
                .ok()
                .and_then(|s| s.after(&now).next()),
        };
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schedule,
            payload,
            status: JobStatus::Active,
            created_at: now,
            next_run_at,
            last_run_at: None,
        }
    }
}

/// Result of one job firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Delivered,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Delivered => "delivered",
            RunOutcome::Failed => "failed",
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(RunOutcome::Delivered),
            "failed" => Ok(RunOutcome::Failed),
            other => Err(format!("unknown run outcome: {other}")),
        }
    }
}

/// One row in a job's run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_id: Uuid,
    pub fired_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    /// Task id on delivery, error text on failure.
    pub detail: String,
}

impl JobRun {
    pub fn new(job_id: Uuid, outcome: RunOutcome, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            fired_at: Utc::now(),
            outcome,
            detail: detail.into(),
        }
    }
}
