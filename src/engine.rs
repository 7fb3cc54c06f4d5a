//! Engine — the external surface over manager, pool, watchdog and
//! scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::controller::pool::PoolConfig;
use crate::controller::PoolManager;
use crate::error::{Error, JobError, Result, TaskError};
use crate::runner::{ProcessRunner, SessionBackend};
use crate::scheduler::{Job, JobDelivery, JobPayload, JobRun, Schedule, Scheduler};
use crate::store::{JobStore, LibSqlBackend, TaskStore};
use crate::task::manager::{
    CompletionHookFire, ReportEffect, TaskContext, TaskManager, TaskSpec,
};
use crate::task::message::{InboundKind, OutboundKind, TaskMessage, Tier};
use crate::task::model::{Task, TaskStatus, TimelineEntry};
use crate::watchdog::Watchdog;

/// How an inbound send was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAck {
    Queued,
    /// The message restarted a terminal task with a fresh pair.
    Revived,
}

/// Status plus the recent timeline, for coordinator display.
#[derive(Debug, Clone)]
pub struct TaskStatusView {
    pub task: Task,
    pub timeline: Vec<TimelineEntry>,
}

/// Delivers fired jobs by creating and starting a task.
///
/// Scheduled work was sanctioned when the job was created, so it skips
/// the approval gate.
struct TaskDelivery {
    manager: Arc<TaskManager>,
    pool: Arc<PoolManager>,
}

#[async_trait]
impl JobDelivery for TaskDelivery {
    async fn deliver(&self, job: &Job) -> std::result::Result<String, JobError> {
        let payload = &job.payload;
        let mut spec = TaskSpec::new(payload.task_name.clone(), payload.task_prompt.clone());
        spec.supervisor_instructions = payload.supervisor_instructions.clone();
        spec.check_interval = payload
            .check_interval_secs
            .map(std::time::Duration::from_secs);
        spec.on_complete = payload.on_complete.clone();
        spec.supervise = payload.supervise;

        let task = self
            .manager
            .create_task(spec)
            .await
            .map_err(|e| JobError::Delivery {
                id: job.id,
                reason: e.to_string(),
            })?;
        self.pool
            .start_pair(&task)
            .await
            .map_err(|e| JobError::Delivery {
                id: job.id,
                reason: e.to_string(),
            })?;
        Ok(task.id.to_string())
    }
}

pub struct Engine {
    config: EngineConfig,
    manager: Arc<TaskManager>,
    pool: Arc<PoolManager>,
    scheduler: Arc<Scheduler>,
    watchdog: Arc<Watchdog>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        backend: Arc<LibSqlBackend>,
        session_backend: Arc<dyn SessionBackend>,
        hook_tx: Option<mpsc::Sender<CompletionHookFire>>,
    ) -> Self {
        let task_store: Arc<dyn TaskStore> = backend.clone();
        let job_store: Arc<dyn JobStore> = backend;

        let manager = Arc::new(TaskManager::new(
            task_store,
            config.data_dir.clone(),
            hook_tx,
        ));
        let worker_runner = Arc::new(ProcessRunner::new(
            session_backend.clone(),
            config.worker_timeout,
        ));
        // supervisor sessions live across assessment cycles, so they get
        // the same generous budget; the per-cycle bound is separate
        let supervisor_runner = Arc::new(ProcessRunner::new(session_backend, config.worker_timeout));
        let pool = Arc::new(PoolManager::new(
            manager.clone(),
            worker_runner,
            supervisor_runner,
            PoolConfig {
                poll_interval: config.poll_interval,
                supervisor_cycle_timeout: config.supervisor_timeout,
                stop_grace: config.stop_grace,
            },
        ));
        let watchdog = Arc::new(Watchdog::new(
            manager.clone(),
            pool.clone(),
            config.watchdog.clone(),
        ));
        let delivery = Arc::new(TaskDelivery {
            manager: manager.clone(),
            pool: pool.clone(),
        });
        let scheduler = Arc::new(Scheduler::new(
            job_store,
            delivery,
            config.scheduler.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            manager,
            pool,
            scheduler,
            watchdog,
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Startup recovery, then the watchdog and scheduler sweep loops.
    pub async fn start(&self) -> Result<()> {
        let parked = self.watchdog.recover().await?;
        if parked > 0 {
            warn!(parked, "Parked orphaned tasks from a previous run");
        }

        let mut loops = self.loops.lock().await;
        loops.push(tokio::spawn(
            self.watchdog.clone().run(self.shutdown_tx.subscribe()),
        ));
        loops.push(tokio::spawn(
            self.scheduler.clone().run(self.shutdown_tx.subscribe()),
        ));
        info!("Engine started");
        Ok(())
    }

    /// Stop sweep loops and wind down every live pair within grace.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.pool.stop_all().await;
        for handle in self.loops.lock().await.drain(..) {
            if tokio::time::timeout(self.config.stop_grace, handle)
                .await
                .is_err()
            {
                warn!("Sweep loop ignored shutdown");
            }
        }
        info!("Engine stopped");
    }

    // ── Coordinator surface ─────────────────────────────────────────

    /// Create a task; unless gated behind approval, its pair starts
    /// immediately.
    pub async fn create_task(&self, mut spec: TaskSpec) -> Result<Task> {
        spec.require_approval = spec.require_approval || self.config.require_approval;
        if spec.check_interval.is_none() {
            spec.check_interval = Some(self.config.default_check_interval);
        }
        let task = self.manager.create_task(spec).await?;
        if task.status == TaskStatus::Pending {
            self.pool.start_pair(&task).await?;
        }
        Ok(task)
    }

    /// Approve a proposed task and start its pair.
    pub async fn approve(&self, id: Uuid) -> Result<Task> {
        let task = self.manager.approve(id).await?;
        self.pool.start_pair(&task).await?;
        Ok(task)
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        self.manager.list(status).await
    }

    pub async fn get_status(&self, id: Uuid, timeline_tail: usize) -> Result<TaskStatusView> {
        let task = self.manager.get(id).await?;
        let timeline = self.manager.timeline(id, timeline_tail).await?;
        Ok(TaskStatusView { task, timeline })
    }

    pub async fn get_logs(&self, id: Uuid, tier: Tier, tail: usize) -> Result<String> {
        self.manager.get(id).await?;
        self.manager.read_log(id, tier, tail).await
    }

    /// Enqueue an inbound message. Terminal tasks accept only
    /// instruction/redirect, which revive them with a fresh pair; the old
    /// mailbox and timeline carry over, the session ids do not stay
    /// attached to a live process.
    pub async fn send(
        &self,
        id: Uuid,
        kind: InboundKind,
        content: &str,
        detail: &str,
    ) -> Result<SendAck> {
        let task = self.manager.get(id).await?;
        if task.status.is_terminal() && kind.can_revive() {
            if self.pool.is_worker_live(id).await {
                return Err(Error::Task(TaskError::AlreadyRunning { id }));
            }
            let task = self
                .manager
                .revive(id, Tier::Coordinator, kind, content, detail)
                .await?;
            self.pool.start_pair(&task).await?;
            return Ok(SendAck::Revived);
        }

        let effect = self
            .manager
            .send_message(id, Tier::Coordinator, kind, content, detail)
            .await?;
        match effect.new_status {
            Some(TaskStatus::Cancelled) => {
                self.pool.stop_pair(id).await;
            }
            // a recovered task answered by a human gets its pair back
            Some(TaskStatus::Running) if !self.pool.is_worker_live(id).await => {
                let task = self.manager.get(id).await?;
                self.pool.start_pair(&task).await?;
            }
            _ => {}
        }
        Ok(SendAck::Queued)
    }

    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        self.send(id, InboundKind::Cancel, "cancelled by coordinator", "")
            .await?;
        Ok(())
    }

    // ── Tier surface (worker/supervisor sessions) ───────────────────

    pub async fn report(
        &self,
        id: Uuid,
        sender: Tier,
        kind: OutboundKind,
        content: &str,
        detail: &str,
    ) -> Result<ReportEffect> {
        let effect = self
            .manager
            .handle_report(id, sender, kind, content, detail)
            .await?;
        if effect.new_status.is_some_and(|s| s.is_terminal()) {
            self.pool.stop_pair(id).await;
        }
        Ok(effect)
    }

    pub async fn check_inbox(&self, id: Uuid) -> Result<Vec<TaskMessage>> {
        self.manager.check_inbox(id).await
    }

    pub async fn set_status(&self, id: Uuid, target: TaskStatus) -> Result<Task> {
        self.manager.set_status(id, target).await
    }

    pub async fn get_context(&self, id: Uuid, limit: usize) -> Result<TaskContext> {
        self.manager.get_context(id, limit).await
    }

    /// Supervisor-only peek at the worker's raw log.
    pub async fn read_peer(&self, id: Uuid, requester: Tier, tail: usize) -> Result<String> {
        if requester != Tier::Supervisor {
            return Err(Error::Task(TaskError::InvalidMessage(
                "only a supervisor may read its worker's log".into(),
            )));
        }
        self.manager.get(id).await?;
        self.manager.read_log(id, Tier::Worker, tail).await
    }

    /// Supervisor-only: push input to the worker through the mailbox.
    pub async fn send_input(&self, id: Uuid, requester: Tier, content: &str) -> Result<()> {
        if requester != Tier::Supervisor {
            return Err(Error::Task(TaskError::InvalidMessage(
                "only a supervisor may feed the worker input".into(),
            )));
        }
        self.manager
            .send_message(id, Tier::Supervisor, InboundKind::Input, content, "")
            .await?;
        Ok(())
    }

    // ── Job surface ─────────────────────────────────────────────────

    pub async fn schedule_job(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        payload: JobPayload,
    ) -> Result<Job> {
        self.scheduler.schedule(name, schedule, payload).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.scheduler.list().await
    }

    pub async fn cancel_job(&self, id: Uuid) -> Result<Job> {
        self.scheduler.cancel(id).await
    }

    pub async fn list_job_runs(&self, id: Uuid, limit: usize) -> Result<Vec<JobRun>> {
        self.scheduler.list_runs(id, limit).await
    }

    // test seam
    #[doc(hidden)]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}
