//! Persistence traits for tasks and scheduled jobs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::job::{Job, JobRun};
use crate::task::message::TaskMessage;
use crate::task::model::{Task, TaskStatus, TimelineEntry};

/// Durable task state, mailboxes and timeline.
///
/// Implementations must make every write durable before returning; the
/// engine relies on the store alone to rebuild state after a restart.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// All tasks, optionally filtered by status, newest first.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError>;

    /// Append a mailbox message. Never deletes.
    async fn append_message(&self, msg: &TaskMessage) -> Result<(), StoreError>;

    /// Unconsumed inbound messages in FIFO order.
    async fn unconsumed_inbound(&self, task_id: Uuid) -> Result<Vec<TaskMessage>, StoreError>;

    async fn mark_consumed(&self, ids: &[Uuid]) -> Result<(), StoreError>;

    /// Most recent messages for a task, oldest first.
    async fn recent_messages(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TaskMessage>, StoreError>;

    async fn append_event(&self, task_id: Uuid, entry: &TimelineEntry) -> Result<(), StoreError>;

    /// Chronological merge of lifecycle events and mailbox messages.
    async fn timeline(&self, task_id: Uuid, limit: usize)
        -> Result<Vec<TimelineEntry>, StoreError>;
}

/// Durable scheduled jobs and their run history.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Active jobs whose `next_run_at` is at or before `now`.
    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    async fn append_run(&self, run: &JobRun) -> Result<(), StoreError>;

    /// Run history for one job, most recent first.
    async fn list_runs(&self, job_id: Uuid, limit: usize) -> Result<Vec<JobRun>, StoreError>;
}
