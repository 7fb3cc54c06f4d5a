//! TaskManager — coordinator-side task state, mailboxes and logs.
//!
//! Every status-changing operation takes a per-task async lock, loads the
//! row, validates the transition and writes back, so concurrent reports,
//! inbound messages and watchdog actions serialize per task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, TaskError};
use crate::store::TaskStore;
use crate::task::message::{InboundKind, OutboundKind, TaskMessage, Tier};
use crate::task::model::{Task, TaskStatus, TimelineEntry, WatchdogState};

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub task_prompt: String,
    pub supervisor_instructions: String,
    pub check_interval: Option<Duration>,
    pub on_complete: Option<String>,
    pub supervise: bool,
    /// Start in `proposed` and wait for approval.
    pub require_approval: bool,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, task_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_prompt: task_prompt.into(),
            supervisor_instructions: String::new(),
            check_interval: None,
            on_complete: None,
            supervise: true,
            require_approval: false,
        }
    }
}

/// How an outbound report was absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Reported,
    /// Worker claimed completion; held for the supervisor's verdict.
    Deferred,
}

/// Result of absorbing an outbound report.
#[derive(Debug, Clone)]
pub struct ReportEffect {
    pub outcome: ReportOutcome,
    /// Set when the report moved the task to a new status.
    pub new_status: Option<TaskStatus>,
}

/// Result of enqueuing an inbound message.
#[derive(Debug, Clone)]
pub struct SendEffect {
    pub new_status: Option<TaskStatus>,
}

/// Handed to the coordinator callback when a hooked task goes terminal.
#[derive(Debug, Clone)]
pub struct CompletionHookFire {
    pub task_id: Uuid,
    pub task_name: String,
    pub hook_prompt: String,
    pub status: TaskStatus,
    pub summary: String,
}

/// Context snapshot served to worker/supervisor sessions.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task: Task,
    pub recent_messages: Vec<TaskMessage>,
}

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    data_dir: PathBuf,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    hook_tx: Option<mpsc::Sender<CompletionHookFire>>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        data_dir: PathBuf,
        hook_tx: Option<mpsc::Sender<CompletionHookFire>>,
    ) -> Self {
        Self {
            store,
            data_dir,
            locks: Mutex::new(HashMap::new()),
            hook_tx,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    async fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks.lock().await.entry(id).or_default().clone()
    }

    async fn load(&self, id: Uuid) -> Result<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| Error::Task(TaskError::NotFound { id }))
    }

    /// Validated transition plus a `status_change` timeline event.
    async fn transition(&self, task: &mut Task, target: TaskStatus) -> Result<()> {
        let from = task.status;
        task.transition_to(target).map_err(Error::Task)?;
        self.store
            .append_event(
                task.id,
                &TimelineEntry::new("status_change", format!("{from} -> {target}")),
            )
            .await?;
        info!(task_id = %task.id, %from, to = %target, "Task status changed");
        Ok(())
    }

    // ── Creation and lookup ─────────────────────────────────────────

    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task> {
        if spec.task_prompt.trim().is_empty() {
            return Err(Error::Task(TaskError::InvalidMessage(
                "task prompt must not be empty".into(),
            )));
        }
        let mut task = Task::new(spec.name, spec.task_prompt);
        task.supervisor_instructions = spec.supervisor_instructions;
        if let Some(interval) = spec.check_interval {
            task.check_interval = interval;
        }
        task.on_complete_hook = spec.on_complete;
        task.supervise = spec.supervise;
        if spec.require_approval {
            task.status = TaskStatus::Proposed;
        }

        self.store.insert_task(&task).await?;
        let event = if spec.require_approval {
            "proposed"
        } else {
            "created"
        };
        self.store
            .append_event(task.id, &TimelineEntry::new(event, task.name.clone()))
            .await?;
        info!(task_id = %task.id, name = %task.name, status = %task.status, "Task created");
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.load(id).await
    }

    pub async fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks(status).await?)
    }

    /// Tasks the watchdog and recovery care about.
    pub async fn list_active(&self) -> Result<Vec<Task>> {
        let all = self.store.list_tasks(None).await?;
        Ok(all.into_iter().filter(|t| t.status.is_active()).collect())
    }

    /// Approve a proposed task so a pair can be started.
    pub async fn approve(&self, id: Uuid) -> Result<Task> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        self.transition(&mut task, TaskStatus::Pending).await?;
        self.store.update_task(&task).await?;
        Ok(task)
    }

    /// Called by the worker controller once its session is live.
    pub async fn mark_started(&self, id: Uuid) -> Result<Task> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        if task.status != TaskStatus::Running {
            self.transition(&mut task, TaskStatus::Running).await?;
        }
        task.touch_activity();
        self.store.update_task(&task).await?;
        Ok(task)
    }

    /// Direct status override for the tier surface. Terminal states and
    /// the approval gate are off limits; those go through reports,
    /// `cancel` and `approve`.
    pub async fn set_status(&self, id: Uuid, target: TaskStatus) -> Result<Task> {
        if target.is_terminal() || target == TaskStatus::Proposed {
            return Err(Error::Task(TaskError::InvalidMessage(format!(
                "status {target} cannot be set directly"
            ))));
        }
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        if task.status != target {
            self.transition(&mut task, target).await?;
            self.store.update_task(&task).await?;
        }
        Ok(task)
    }

    // ── Outbound reports (worker/supervisor → coordinator) ──────────

    pub async fn handle_report(
        &self,
        id: Uuid,
        sender: Tier,
        kind: OutboundKind,
        content: &str,
        detail: &str,
    ) -> Result<ReportEffect> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;

        if task.status.is_terminal() {
            return Err(Error::Task(TaskError::ReportRejected {
                id,
                reason: format!("task is already {}", task.status),
            }));
        }
        if kind.supervisor_only() && sender == Tier::Worker {
            return Err(Error::Task(TaskError::ReportRejected {
                id,
                reason: format!("{kind} may only come from a supervisor"),
            }));
        }
        if task.awaiting_input && sender == Tier::Worker {
            return Err(Error::Task(TaskError::ReportRejected {
                id,
                reason: "task is waiting for input".into(),
            }));
        }

        self.store
            .append_message(&TaskMessage::outbound(id, sender, kind, content, detail))
            .await?;

        task.touch_activity();
        if kind != OutboundKind::Escalation {
            task.escalated_at = None;
        }

        let mut outcome = ReportOutcome::Reported;
        let mut new_status = None;

        match kind {
            OutboundKind::Progress | OutboundKind::Artifact | OutboundKind::Intervention => {}
            OutboundKind::NeedsInput => {
                if task.status == TaskStatus::Running {
                    self.transition(&mut task, TaskStatus::NeedsInput).await?;
                    new_status = Some(TaskStatus::NeedsInput);
                }
                task.awaiting_input = true;
            }
            OutboundKind::Completed => {
                if sender == Tier::Worker && task.supervise {
                    task.defer_completion(content, detail);
                    self.store
                        .append_event(
                            id,
                            &TimelineEntry::new("completion_deferred", content)
                                .with_detail("held for supervisor verdict"),
                        )
                        .await?;
                    debug!(task_id = %id, "Worker completion deferred");
                    outcome = ReportOutcome::Deferred;
                } else {
                    self.transition(&mut task, TaskStatus::Completed).await?;
                    task.clear_deferred();
                    new_status = Some(TaskStatus::Completed);
                }
            }
            OutboundKind::Failed => {
                let reason = if sender == Tier::Supervisor && task.completion_deferred {
                    "supervisor_rejected".to_string()
                } else if content.is_empty() {
                    "failed".to_string()
                } else {
                    content.to_string()
                };
                self.transition(&mut task, TaskStatus::Failed).await?;
                task.fail_reason = Some(reason);
                task.clear_deferred();
                new_status = Some(TaskStatus::Failed);
            }
            OutboundKind::Assessment => {
                task.supervisor_assessment_count += 1;
            }
            OutboundKind::Escalation => {
                task.escalated_at = Some(Utc::now());
            }
        }

        self.store.update_task(&task).await?;
        if task.status.is_terminal() {
            self.fire_on_complete(&task).await;
        }
        Ok(ReportEffect {
            outcome,
            new_status,
        })
    }

    // ── Inbound messages (coordinator/supervisor → pair) ────────────

    pub async fn send_message(
        &self,
        id: Uuid,
        sender: Tier,
        kind: InboundKind,
        content: &str,
        detail: &str,
    ) -> Result<SendEffect> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;

        if task.status.is_terminal() {
            return Err(Error::Task(TaskError::InvalidMessage(format!(
                "task is {}; only instruction/redirect can restart it",
                task.status
            ))));
        }
        // nothing consumes the mailbox before approval
        if task.status == TaskStatus::Proposed && kind != InboundKind::Cancel {
            return Err(Error::Task(TaskError::InvalidMessage(
                "task awaits approval; only cancel applies".into(),
            )));
        }

        self.store
            .append_message(&TaskMessage::inbound(id, sender, kind, content, detail))
            .await?;

        let mut new_status = None;
        match kind {
            InboundKind::Pause => {
                if task.status == TaskStatus::Running {
                    self.transition(&mut task, TaskStatus::Paused).await?;
                    new_status = Some(TaskStatus::Paused);
                }
            }
            InboundKind::Resume => {
                if task.status == TaskStatus::Paused {
                    self.transition(&mut task, TaskStatus::Running).await?;
                    new_status = Some(TaskStatus::Running);
                }
            }
            InboundKind::Cancel => {
                self.transition(&mut task, TaskStatus::Cancelled).await?;
                new_status = Some(TaskStatus::Cancelled);
            }
            InboundKind::Instruction | InboundKind::Input => {
                task.awaiting_input = false;
                if task.status == TaskStatus::NeedsInput {
                    self.transition(&mut task, TaskStatus::Running).await?;
                    new_status = Some(TaskStatus::Running);
                }
            }
            InboundKind::Redirect => {
                if !detail.is_empty() {
                    task.supervisor_instructions = detail.to_string();
                }
            }
            InboundKind::Terminate => {}
        }

        self.store.update_task(&task).await?;
        if task.status.is_terminal() {
            self.fire_on_complete(&task).await;
        }
        Ok(SendEffect { new_status })
    }

    /// Restart a terminal task from a fresh instruction or redirect.
    ///
    /// Resets watchdog and deferral bookkeeping; the enqueued message is
    /// left unconsumed so the fresh worker picks it up first thing. The
    /// prior mailbox and timeline are untouched.
    pub async fn revive(
        &self,
        id: Uuid,
        sender: Tier,
        kind: InboundKind,
        content: &str,
        detail: &str,
    ) -> Result<Task> {
        if !kind.can_revive() {
            return Err(Error::Task(TaskError::InvalidMessage(format!(
                "{kind} cannot restart a terminal task"
            ))));
        }
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        if !task.status.is_terminal() {
            return Err(Error::Task(TaskError::InvalidMessage(format!(
                "task is {}, not terminal",
                task.status
            ))));
        }

        self.store
            .append_message(&TaskMessage::inbound(id, sender, kind, content, detail))
            .await?;

        if kind == InboundKind::Redirect && !detail.is_empty() {
            task.supervisor_instructions = detail.to_string();
        }
        task.clear_deferred();
        task.fail_reason = None;
        task.completed_at = None;
        task.awaiting_input = false;
        task.watchdog_state = WatchdogState::None;
        task.restart_count = 0;
        task.worker_exited_at = None;
        task.escalated_at = None;

        self.transition(&mut task, TaskStatus::Running).await?;
        self.store
            .append_event(id, &TimelineEntry::new("resumed", content))
            .await?;
        task.touch_activity();
        self.store.update_task(&task).await?;
        Ok(task)
    }

    /// Drain unconsumed inbound messages.
    ///
    /// Terminal tasks always yield a synthetic `terminate` so a lingering
    /// controller winds down on its next poll.
    pub async fn check_inbox(&self, id: Uuid) -> Result<Vec<TaskMessage>> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let task = self.load(id).await?;
        if task.status.is_terminal() {
            return Ok(vec![TaskMessage::inbound(
                id,
                Tier::Coordinator,
                InboundKind::Terminate,
                format!("task is {}", task.status),
                "",
            )]);
        }

        let messages = self.store.unconsumed_inbound(id).await?;
        if !messages.is_empty() {
            let ids: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
            self.store.mark_consumed(&ids).await?;
        }
        Ok(messages)
    }

    pub async fn get_context(&self, id: Uuid, limit: usize) -> Result<TaskContext> {
        let task = self.load(id).await?;
        let recent_messages = self.store.recent_messages(id, limit).await?;
        Ok(TaskContext {
            task,
            recent_messages,
        })
    }

    pub async fn timeline(&self, id: Uuid, limit: usize) -> Result<Vec<TimelineEntry>> {
        self.load(id).await?;
        Ok(self.store.timeline(id, limit).await?)
    }

    pub async fn append_event(&self, id: Uuid, entry: TimelineEntry) -> Result<()> {
        Ok(self.store.append_event(id, &entry).await?)
    }

    // ── Session and liveness bookkeeping ────────────────────────────

    pub async fn record_worker_session(&self, id: Uuid, session_id: &str) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        task.worker_session_id = Some(session_id.to_string());
        task.worker_exited_at = None;
        self.store.update_task(&task).await?;
        Ok(())
    }

    pub async fn record_supervisor_session(&self, id: Uuid, session_id: &str) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        task.supervisor_session_id = Some(session_id.to_string());
        self.store.update_task(&task).await?;
        Ok(())
    }

    pub async fn mark_worker_exited(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        task.worker_exited_at = Some(Utc::now());
        self.store.update_task(&task).await?;
        Ok(())
    }

    pub async fn touch_activity(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        task.touch_activity();
        self.store.update_task(&task).await?;
        Ok(())
    }

    // ── Watchdog bookkeeping ────────────────────────────────────────

    /// Record an idle warning and nudge the worker through its mailbox.
    pub async fn record_watchdog_warning(&self, id: Uuid, idle: Duration) -> Result<()> {
        {
            let lock = self.lock_for(id).await;
            let _guard = lock.lock().await;
            let mut task = self.load(id).await?;
            task.watchdog_state = WatchdogState::Warned;
            self.store.update_task(&task).await?;
            self.store
                .append_event(
                    id,
                    &TimelineEntry::new(
                        "watchdog_warning",
                        format!("no activity for {}s", idle.as_secs()),
                    ),
                )
                .await?;
        }
        self.send_message(
            id,
            Tier::Coordinator,
            InboundKind::Instruction,
            "No activity has been observed on this task for a while. Report progress or \
             explain what is blocking you.",
            "",
        )
        .await?;
        Ok(())
    }

    /// Bump the restart counter before the pair is respawned.
    pub async fn record_watchdog_restart(&self, id: Uuid) -> Result<u32> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        task.restart_count += 1;
        task.watchdog_state = WatchdogState::Restarted;
        task.touch_activity();
        self.store.update_task(&task).await?;
        self.store
            .append_event(
                id,
                &TimelineEntry::new(
                    "watchdog_restart",
                    format!("restart {} of the worker", task.restart_count),
                ),
            )
            .await?;
        Ok(task.restart_count)
    }

    pub async fn record_watchdog_gave_up(&self, id: Uuid) -> Result<()> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        task.watchdog_state = WatchdogState::GaveUp;
        self.store.update_task(&task).await?;
        Ok(())
    }

    /// Startup recovery: an orphaned running/paused task is parked in
    /// `needs_input` so a human decides; it is never silently resumed.
    pub async fn mark_recovered(&self, id: Uuid) -> Result<bool> {
        let lock = self.lock_for(id).await;
        let _guard = lock.lock().await;
        let mut task = self.load(id).await?;
        if !matches!(task.status, TaskStatus::Running | TaskStatus::Paused) {
            return Ok(false);
        }
        self.transition(&mut task, TaskStatus::NeedsInput).await?;
        self.store.update_task(&task).await?;
        self.store
            .append_event(
                id,
                &TimelineEntry::new(
                    "recovered",
                    "engine restarted with this task in flight; send an instruction to resume",
                ),
            )
            .await?;
        Ok(true)
    }

    // ── Raw per-task logs ───────────────────────────────────────────

    fn log_path(&self, id: Uuid, tier: Tier) -> PathBuf {
        self.data_dir
            .join("tasks")
            .join(id.to_string())
            .join(format!("{tier}.log"))
    }

    pub async fn append_log(&self, id: Uuid, tier: Tier, lines: &[String]) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let path = self.log_path(id, tier);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Config(e.into()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Config(e.into()))?;
        let mut buf = lines.join("\n");
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| Error::Config(e.into()))?;
        Ok(())
    }

    /// Last `tail` lines of a tier's raw log. Empty if nothing was written.
    pub async fn read_log(&self, id: Uuid, tier: Tier, tail: usize) -> Result<String> {
        let path = self.log_path(id, tier);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(Error::Config(e.into())),
        };
        let lines: Vec<&str> = contents.lines().collect();
        let start = lines.len().saturating_sub(tail);
        Ok(lines[start..].join("\n"))
    }

    // ── Completion hooks ────────────────────────────────────────────

    async fn fire_on_complete(&self, task: &Task) {
        let Some(hook_prompt) = task.on_complete_hook.clone() else {
            return;
        };
        let Some(tx) = &self.hook_tx else {
            return;
        };
        let fire = CompletionHookFire {
            task_id: task.id,
            task_name: task.name.clone(),
            hook_prompt,
            status: task.status,
            summary: task
                .fail_reason
                .clone()
                .unwrap_or_else(|| task.completion_deferred_summary.clone()),
        };
        if let Err(e) = tx.try_send(fire) {
            warn!(task_id = %task.id, "Dropping completion hook: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn manager() -> TaskManager {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dir = std::env::temp_dir().join(format!("overseer-test-{}", Uuid::new_v4()));
        TaskManager::new(store, dir, None)
    }

    async fn running_task(mgr: &TaskManager, supervise: bool) -> Task {
        let mut spec = TaskSpec::new("t", "do the thing");
        spec.supervise = supervise;
        let task = mgr.create_task(spec).await.unwrap();
        mgr.mark_started(task.id).await.unwrap()
    }

    #[tokio::test]
    async fn create_rejects_empty_prompt() {
        let mgr = manager().await;
        let spec = TaskSpec::new("t", "   ");
        assert!(mgr.create_task(spec).await.is_err());
    }

    #[tokio::test]
    async fn unsupervised_completion_is_immediate() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        let effect = mgr
            .handle_report(task.id, Tier::Worker, OutboundKind::Completed, "done", "")
            .await
            .unwrap();
        assert_eq!(effect.outcome, ReportOutcome::Reported);
        assert_eq!(effect.new_status, Some(TaskStatus::Completed));
        let task = mgr.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn supervised_completion_defers_until_verdict() {
        let mgr = manager().await;
        let task = running_task(&mgr, true).await;
        let effect = mgr
            .handle_report(task.id, Tier::Worker, OutboundKind::Completed, "done", "d")
            .await
            .unwrap();
        assert_eq!(effect.outcome, ReportOutcome::Deferred);
        assert!(effect.new_status.is_none());

        let mid = mgr.get(task.id).await.unwrap();
        assert_eq!(mid.status, TaskStatus::Running);
        assert!(mid.completion_deferred);
        assert_eq!(mid.completion_deferred_summary, "done");

        mgr.handle_report(task.id, Tier::Supervisor, OutboundKind::Completed, "verified", "")
            .await
            .unwrap();
        let done = mgr.get(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(!done.completion_deferred);
    }

    #[tokio::test]
    async fn supervisor_rejection_fails_deferred_task() {
        let mgr = manager().await;
        let task = running_task(&mgr, true).await;
        mgr.handle_report(task.id, Tier::Worker, OutboundKind::Completed, "done", "")
            .await
            .unwrap();
        mgr.handle_report(task.id, Tier::Supervisor, OutboundKind::Failed, "not done", "")
            .await
            .unwrap();
        let task = mgr.get(task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.fail_reason.as_deref(), Some("supervisor_rejected"));
    }

    #[tokio::test]
    async fn worker_cannot_emit_supervisor_kinds() {
        let mgr = manager().await;
        let task = running_task(&mgr, true).await;
        let err = mgr
            .handle_report(task.id, Tier::Worker, OutboundKind::Assessment, "looks ok", "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Task(TaskError::ReportRejected { .. })
        ));
    }

    #[tokio::test]
    async fn needs_input_blocks_worker_until_answered() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        mgr.handle_report(task.id, Tier::Worker, OutboundKind::NeedsInput, "which db?", "")
            .await
            .unwrap();
        let task_mid = mgr.get(task.id).await.unwrap();
        assert_eq!(task_mid.status, TaskStatus::NeedsInput);
        assert!(task_mid.awaiting_input);

        // further worker reports bounce
        let err = mgr
            .handle_report(task.id, Tier::Worker, OutboundKind::Progress, "working", "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::ReportRejected { .. })));

        mgr.send_message(task.id, Tier::Coordinator, InboundKind::Input, "use sqlite", "")
            .await
            .unwrap();
        let task_after = mgr.get(task.id).await.unwrap();
        assert_eq!(task_after.status, TaskStatus::Running);
        assert!(!task_after.awaiting_input);

        mgr.handle_report(task.id, Tier::Worker, OutboundKind::Progress, "resumed", "")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pause_resume_cycle() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        let effect = mgr
            .send_message(task.id, Tier::Coordinator, InboundKind::Pause, "hold", "")
            .await
            .unwrap();
        assert_eq!(effect.new_status, Some(TaskStatus::Paused));
        let effect = mgr
            .send_message(task.id, Tier::Coordinator, InboundKind::Resume, "go", "")
            .await
            .unwrap();
        assert_eq!(effect.new_status, Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_blocks_reports() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        mgr.send_message(task.id, Tier::Coordinator, InboundKind::Cancel, "stop", "")
            .await
            .unwrap();
        let task_now = mgr.get(task.id).await.unwrap();
        assert_eq!(task_now.status, TaskStatus::Cancelled);

        let err = mgr
            .handle_report(task.id, Tier::Worker, OutboundKind::Progress, "late", "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::ReportRejected { .. })));
    }

    #[tokio::test]
    async fn terminal_inbox_yields_synthetic_terminate() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        mgr.send_message(task.id, Tier::Coordinator, InboundKind::Cancel, "stop", "")
            .await
            .unwrap();
        let inbox = mgr.check_inbox(task.id).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(
            inbox[0].kind.as_str(),
            InboundKind::Terminate.as_str()
        );
    }

    #[tokio::test]
    async fn inbox_consumption_is_fifo_and_once() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        mgr.send_message(task.id, Tier::Coordinator, InboundKind::Instruction, "one", "")
            .await
            .unwrap();
        mgr.send_message(task.id, Tier::Coordinator, InboundKind::Instruction, "two", "")
            .await
            .unwrap();

        let inbox = mgr.check_inbox(task.id).await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].content, "one");
        assert!(mgr.check_inbox(task.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn revive_resets_bookkeeping_and_keeps_history() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        mgr.handle_report(task.id, Tier::Worker, OutboundKind::Failed, "crash", "")
            .await
            .unwrap();
        let failed = mgr.get(task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        let timeline_before = mgr.timeline(task.id, 100).await.unwrap().len();

        let revived = mgr
            .revive(task.id, Tier::Coordinator, InboundKind::Instruction, "try again", "")
            .await
            .unwrap();
        assert_eq!(revived.status, TaskStatus::Running);
        assert!(revived.fail_reason.is_none());
        assert_eq!(revived.restart_count, 0);
        assert_eq!(revived.watchdog_state, WatchdogState::None);

        // history survives and grows
        let timeline_after = mgr.timeline(task.id, 100).await.unwrap().len();
        assert!(timeline_after > timeline_before);

        // the instruction is waiting for the fresh worker
        let inbox = mgr.check_inbox(task.id).await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].content, "try again");
    }

    #[tokio::test]
    async fn revive_rejects_non_terminal_and_wrong_kinds() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        assert!(mgr
            .revive(task.id, Tier::Coordinator, InboundKind::Instruction, "x", "")
            .await
            .is_err());
        mgr.send_message(task.id, Tier::Coordinator, InboundKind::Cancel, "stop", "")
            .await
            .unwrap();
        assert!(mgr
            .revive(task.id, Tier::Coordinator, InboundKind::Input, "x", "")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn assessment_counting_and_escalation_flag() {
        let mgr = manager().await;
        let task = running_task(&mgr, true).await;
        mgr.handle_report(task.id, Tier::Worker, OutboundKind::Completed, "done", "")
            .await
            .unwrap();
        mgr.handle_report(task.id, Tier::Supervisor, OutboundKind::Assessment, "checking", "")
            .await
            .unwrap();
        mgr.handle_report(task.id, Tier::Supervisor, OutboundKind::Assessment, "still", "")
            .await
            .unwrap();
        let t = mgr.get(task.id).await.unwrap();
        assert_eq!(t.supervisor_assessment_count, 2);

        mgr.handle_report(task.id, Tier::Supervisor, OutboundKind::Escalation, "help", "")
            .await
            .unwrap();
        let t = mgr.get(task.id).await.unwrap();
        assert!(t.escalated_at.is_some());

        // any later signal clears the escalation vote
        mgr.handle_report(task.id, Tier::Supervisor, OutboundKind::Assessment, "ok now", "")
            .await
            .unwrap();
        let t = mgr.get(task.id).await.unwrap();
        assert!(t.escalated_at.is_none());
    }

    #[tokio::test]
    async fn logs_append_and_tail() {
        let mgr = manager().await;
        let task = running_task(&mgr, false).await;
        let lines: Vec<String> = (1..=5).map(|i| format!("line {i}")).collect();
        mgr.append_log(task.id, Tier::Worker, &lines).await.unwrap();

        let tail = mgr.read_log(task.id, Tier::Worker, 2).await.unwrap();
        assert_eq!(tail, "line 4\nline 5");
        let empty = mgr.read_log(task.id, Tier::Supervisor, 10).await.unwrap();
        assert!(empty.is_empty());
    }
}
