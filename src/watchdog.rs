//! Watchdog — staleness escalation, supervision deadlines and startup
//! recovery.
//!
//! One sweep per `sweep_interval` over every active task. Escalation is
//! warn, then restart (bounded by `max_restarts`), then `failed`
//! (`watchdog_exhausted`). A stuck supervised completion is force-finalized
//! from the worker's own report so a task can never hang on a supervisor
//! that refuses to rule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::WatchdogConfig;
use crate::controller::PoolManager;
use crate::error::Result;
use crate::task::manager::TaskManager;
use crate::task::message::{OutboundKind, Tier};
use crate::task::model::{Task, TaskStatus, TimelineEntry, WatchdogState};

pub struct Watchdog {
    manager: Arc<TaskManager>,
    pool: Arc<PoolManager>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(manager: Arc<TaskManager>, pool: Arc<PoolManager>, config: WatchdogConfig) -> Self {
        Self {
            manager,
            pool,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        warn!("Watchdog sweep failed: {e}");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One pass over all active tasks. Per-task failures are logged and
    /// never abort the sweep.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<()> {
        for task in self.manager.list_active().await? {
            if let Err(e) = self.check_task(&task, now).await {
                warn!(task_id = %task.id, "Watchdog check failed: {e}");
            }
        }
        Ok(())
    }

    async fn check_task(&self, task: &Task, now: DateTime<Utc>) -> Result<()> {
        if task.completion_deferred {
            return self.check_deferred(task).await;
        }

        if let Some(escalated_at) = task.escalated_at {
            let waited = (now - escalated_at).to_std().unwrap_or_default();
            if waited >= self.config.sweep_interval {
                warn!(task_id = %task.id, "Escalation unanswered, failing task");
                self.manager
                    .handle_report(
                        task.id,
                        Tier::Coordinator,
                        OutboundKind::Failed,
                        "supervisor_escalated",
                        "supervisor escalation went unanswered",
                    )
                    .await?;
                self.pool.stop_pair(task.id).await;
                return Ok(());
            }
        }

        // Staleness applies to running tasks; paused and needs_input tasks
        // are idle by human choice.
        if task.status != TaskStatus::Running {
            return Ok(());
        }

        let idle = (now - task.last_activity_at).to_std().unwrap_or_default();
        if idle < self.config.grace || idle < self.config.warn_after {
            return Ok(());
        }

        if idle >= self.config.restart_after {
            if task.restart_count >= self.config.max_restarts {
                warn!(task_id = %task.id, restarts = task.restart_count, "Watchdog out of restarts");
                self.manager.record_watchdog_gave_up(task.id).await?;
                self.manager
                    .handle_report(
                        task.id,
                        Tier::Coordinator,
                        OutboundKind::Failed,
                        "watchdog_exhausted",
                        &format!("no activity after {} restarts", task.restart_count),
                    )
                    .await?;
                self.pool.stop_pair(task.id).await;
            } else {
                let count = self.manager.record_watchdog_restart(task.id).await?;
                info!(task_id = %task.id, restart = count, "Watchdog restarting stale worker");
                let fresh = self.manager.get(task.id).await?;
                self.pool.restart_pair(&fresh).await?;
            }
            return Ok(());
        }

        if task.watchdog_state == WatchdogState::None {
            info!(task_id = %task.id, idle_secs = idle.as_secs(), "Watchdog warning");
            self.manager
                .record_watchdog_warning(task.id, idle)
                .await?;
        }
        Ok(())
    }

    /// Decision deadline for a held completion: once the worker is gone a
    /// single assessment is all the deliberation the supervisor gets; a
    /// live worker buys it one more.
    async fn check_deferred(&self, task: &Task) -> Result<()> {
        let worker_live = self.pool.is_worker_live(task.id).await;
        let force = if worker_live {
            task.supervisor_assessment_count >= 2
        } else {
            task.supervisor_assessment_count >= 1
        };
        if !force {
            return Ok(());
        }

        warn!(
            task_id = %task.id,
            assessments = task.supervisor_assessment_count,
            "Supervisor failed to rule, forcing completion from worker report"
        );
        self.manager
            .append_event(
                task.id,
                TimelineEntry::new(
                    "supervision_overridden",
                    "supervisor never issued a verdict; finalizing from the worker's report",
                ),
            )
            .await?;
        let summary = if task.completion_deferred_summary.is_empty() {
            "completed".to_string()
        } else {
            task.completion_deferred_summary.clone()
        };
        self.manager
            .handle_report(
                task.id,
                Tier::Coordinator,
                OutboundKind::Completed,
                &summary,
                &task.completion_deferred_detail,
            )
            .await?;
        self.pool.stop_pair(task.id).await;
        Ok(())
    }

    /// Startup recovery: tasks persisted as active but with no live pair
    /// are parked in `needs_input`. Returns how many were parked.
    pub async fn recover(&self) -> Result<usize> {
        let mut parked = 0;
        for task in self.manager.list_active().await? {
            if self.pool.is_worker_live(task.id).await {
                continue;
            }
            if self.manager.mark_recovered(task.id).await? {
                info!(task_id = %task.id, was = %task.status, "Recovered orphaned task");
                parked += 1;
            }
        }
        Ok(parked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::pool::PoolConfig;
    use crate::error::RunnerError;
    use crate::runner::{PollOutcome, ProcessRunner, SessionBackend};
    use crate::store::LibSqlBackend;
    use crate::task::manager::TaskSpec;
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    struct IdleBackend;

    #[async_trait]
    impl SessionBackend for IdleBackend {
        async fn start_session(
            &self,
            _prompt: &str,
            _resume: Option<&str>,
        ) -> std::result::Result<String, RunnerError> {
            Ok(Uuid::new_v4().to_string())
        }

        async fn poll(&self, _session_id: &str) -> std::result::Result<PollOutcome, RunnerError> {
            Ok(PollOutcome::default())
        }

        async fn send_input(&self, _session_id: &str, _text: &str) -> std::result::Result<(), RunnerError> {
            Ok(())
        }

        async fn terminate(&self, _session_id: &str) -> std::result::Result<(), RunnerError> {
            Ok(())
        }
    }

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            sweep_interval: Duration::from_secs(30),
            warn_after: Duration::from_secs(300),
            restart_after: Duration::from_secs(900),
            grace: Duration::from_secs(60),
            max_restarts: 2,
        }
    }

    async fn setup() -> (Arc<TaskManager>, Arc<PoolManager>, Watchdog) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dir = std::env::temp_dir().join(format!("overseer-test-{}", Uuid::new_v4()));
        let manager = Arc::new(TaskManager::new(store, dir, None));
        let backend = Arc::new(IdleBackend);
        let runner = Arc::new(ProcessRunner::new(backend.clone(), Duration::from_secs(600)));
        let sup_runner = Arc::new(ProcessRunner::new(backend, Duration::from_secs(600)));
        let pool = Arc::new(PoolManager::new(
            manager.clone(),
            runner,
            sup_runner,
            PoolConfig {
                poll_interval: Duration::from_millis(5),
                supervisor_cycle_timeout: Duration::from_millis(50),
                stop_grace: Duration::from_millis(200),
            },
        ));
        let watchdog = Watchdog::new(manager.clone(), pool.clone(), config());
        (manager, pool, watchdog)
    }

    async fn running_task(manager: &TaskManager, supervise: bool) -> Uuid {
        let mut spec = TaskSpec::new("t", "p");
        spec.supervise = supervise;
        let task = manager.create_task(spec).await.unwrap();
        manager.mark_started(task.id).await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn fresh_task_is_left_alone() {
        let (manager, _pool, watchdog) = setup().await;
        let id = running_task(&manager, false).await;
        watchdog.sweep_once(Utc::now()).await.unwrap();
        let task = manager.get(id).await.unwrap();
        assert_eq!(task.watchdog_state, WatchdogState::None);
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn idle_past_warn_threshold_warns_once() {
        let (manager, _pool, watchdog) = setup().await;
        let id = running_task(&manager, false).await;

        let later = Utc::now() + chrono::Duration::seconds(400);
        watchdog.sweep_once(later).await.unwrap();
        let task = manager.get(id).await.unwrap();
        assert_eq!(task.watchdog_state, WatchdogState::Warned);

        // the nudge is sitting in the inbox
        let inbox = manager.check_inbox(id).await.unwrap();
        assert_eq!(inbox.len(), 1);

        // second sweep at the same idle level does not warn again
        watchdog.sweep_once(later).await.unwrap();
        assert!(manager.check_inbox(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn idle_past_restart_threshold_restarts_with_counter() {
        let (manager, pool, watchdog) = setup().await;
        let id = running_task(&manager, false).await;

        let later = Utc::now() + chrono::Duration::seconds(1000);
        watchdog.sweep_once(later).await.unwrap();
        let task = manager.get(id).await.unwrap();
        assert_eq!(task.restart_count, 1);
        assert_eq!(task.watchdog_state, WatchdogState::Restarted);
        assert_eq!(task.status, TaskStatus::Running);
        assert!(pool.is_worker_live(id).await);
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn exhausted_restarts_fail_the_task() {
        let (manager, pool, watchdog) = setup().await;
        let id = running_task(&manager, false).await;

        // two allowed restarts, then the axe
        for expected in 1..=2u32 {
            let later = Utc::now() + chrono::Duration::seconds(1000);
            watchdog.sweep_once(later).await.unwrap();
            assert_eq!(manager.get(id).await.unwrap().restart_count, expected);
            // park the respawned worker before backdating, so its startup
            // cannot refresh the activity stamp underneath us
            pool.stop_pair(id).await;
            let mut task = manager.get(id).await.unwrap();
            task.last_activity_at = Utc::now() - chrono::Duration::seconds(2000);
            manager.store().update_task(&task).await.unwrap();
        }

        watchdog.sweep_once(Utc::now()).await.unwrap();
        let task = manager.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.fail_reason.as_deref(), Some("watchdog_exhausted"));
        assert_eq!(task.watchdog_state, WatchdogState::GaveUp);
        assert!(!pool.is_worker_live(id).await);
    }

    #[tokio::test]
    async fn stuck_supervisor_with_dead_worker_is_overridden() {
        let (manager, _pool, watchdog) = setup().await;
        let id = running_task(&manager, true).await;
        manager
            .handle_report(id, Tier::Worker, OutboundKind::Completed, "done", "proof")
            .await
            .unwrap();
        manager
            .handle_report(id, Tier::Supervisor, OutboundKind::Assessment, "hmm", "")
            .await
            .unwrap();
        // no live pair in this test, so the worker counts as dead
        watchdog.sweep_once(Utc::now()).await.unwrap();

        let task = manager.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        let timeline = manager.timeline(id, 100).await.unwrap();
        assert!(timeline.iter().any(|e| e.event == "supervision_overridden"));
    }

    #[tokio::test]
    async fn deferred_completion_waits_for_the_first_assessment() {
        let (manager, _pool, watchdog) = setup().await;
        let id = running_task(&manager, true).await;
        manager
            .handle_report(id, Tier::Worker, OutboundKind::Completed, "done", "")
            .await
            .unwrap();

        watchdog.sweep_once(Utc::now()).await.unwrap();
        let task = manager.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.completion_deferred);
    }

    #[tokio::test]
    async fn unanswered_escalation_fails_the_task() {
        let (manager, _pool, watchdog) = setup().await;
        let id = running_task(&manager, true).await;
        manager
            .handle_report(id, Tier::Supervisor, OutboundKind::Escalation, "need a human", "")
            .await
            .unwrap();

        // within one sweep interval nothing happens
        watchdog.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(manager.get(id).await.unwrap().status, TaskStatus::Running);

        let later = Utc::now() + chrono::Duration::seconds(60);
        watchdog.sweep_once(later).await.unwrap();
        let task = manager.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.fail_reason.as_deref(), Some("supervisor_escalated"));
    }

    #[tokio::test]
    async fn recovery_parks_orphaned_tasks() {
        let (manager, _pool, watchdog) = setup().await;
        let running = running_task(&manager, false).await;

        let mut spec = TaskSpec::new("paused", "p");
        spec.supervise = false;
        let paused = manager.create_task(spec).await.unwrap();
        manager.mark_started(paused.id).await.unwrap();
        manager
            .send_message(paused.id, Tier::Coordinator, crate::task::message::InboundKind::Pause, "hold", "")
            .await
            .unwrap();

        let parked = watchdog.recover().await.unwrap();
        assert_eq!(parked, 2);
        assert_eq!(
            manager.get(running).await.unwrap().status,
            TaskStatus::NeedsInput
        );
        assert_eq!(
            manager.get(paused.id).await.unwrap().status,
            TaskStatus::NeedsInput
        );

        // recovery is idempotent
        assert_eq!(watchdog.recover().await.unwrap(), 0);
    }
}
