//! Pool manager — tracks the live worker/supervisor pair per task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::controller::supervisor::SupervisorController;
use crate::controller::worker::{ControlSignal, WorkerController};
use crate::error::{Error, Result, TaskError};
use crate::runner::ProcessRunner;
use crate::task::manager::TaskManager;
use crate::task::model::Task;

struct ControllerHandle {
    handle: JoinHandle<()>,
    ctrl_tx: mpsc::Sender<ControlSignal>,
}

struct ControllerPair {
    worker: ControllerHandle,
    supervisor: Option<ControllerHandle>,
}

/// Knobs the pool passes down to the controllers it spawns.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub poll_interval: Duration,
    pub supervisor_cycle_timeout: Duration,
    pub stop_grace: Duration,
}

pub struct PoolManager {
    manager: Arc<TaskManager>,
    worker_runner: Arc<ProcessRunner>,
    supervisor_runner: Arc<ProcessRunner>,
    config: PoolConfig,
    pairs: Mutex<HashMap<Uuid, ControllerPair>>,
}

impl PoolManager {
    pub fn new(
        manager: Arc<TaskManager>,
        worker_runner: Arc<ProcessRunner>,
        supervisor_runner: Arc<ProcessRunner>,
        config: PoolConfig,
    ) -> Self {
        Self {
            manager,
            worker_runner,
            supervisor_runner,
            config,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the worker (and supervisor, when configured) for a task.
    ///
    /// The pair table is checked and updated under one lock, so two
    /// concurrent starts for the same task cannot both win.
    pub async fn start_pair(&self, task: &Task) -> Result<()> {
        let mut pairs = self.pairs.lock().await;
        if let Some(pair) = pairs.get(&task.id) {
            if !pair.worker.handle.is_finished() {
                return Err(Error::Task(TaskError::AlreadyRunning { id: task.id }));
            }
            pairs.remove(&task.id);
        }

        let (worker_tx, worker_rx) = mpsc::channel(4);
        let worker = WorkerController::new(
            task.id,
            self.manager.clone(),
            self.worker_runner.clone(),
            self.config.poll_interval,
        );
        let worker = ControllerHandle {
            handle: tokio::spawn(worker.run(worker_rx)),
            ctrl_tx: worker_tx,
        };

        let supervisor = if task.supervise {
            let (tx, rx) = mpsc::channel(4);
            let controller = SupervisorController::new(
                task.id,
                self.manager.clone(),
                self.supervisor_runner.clone(),
                self.config.supervisor_cycle_timeout,
                self.config.poll_interval,
            );
            Some(ControllerHandle {
                handle: tokio::spawn(controller.run(rx)),
                ctrl_tx: tx,
            })
        } else {
            None
        };

        pairs.insert(task.id, ControllerPair { worker, supervisor });
        info!(task_id = %task.id, supervised = task.supervise, "Controller pair started");
        Ok(())
    }

    /// Cooperative stop with a bounded grace period, then abort.
    /// Returns whether a pair existed.
    pub async fn stop_pair(&self, task_id: Uuid) -> bool {
        let Some(pair) = self.pairs.lock().await.remove(&task_id) else {
            return false;
        };
        let mut handles = vec![pair.worker];
        if let Some(supervisor) = pair.supervisor {
            handles.push(supervisor);
        }
        for handle in &handles {
            let _ = handle.ctrl_tx.try_send(ControlSignal::Stop);
        }
        for mut entry in handles {
            if tokio::time::timeout(self.config.stop_grace, &mut entry.handle)
                .await
                .is_err()
            {
                debug!(task_id = %task_id, "Controller ignored stop, aborting");
                entry.handle.abort();
            }
        }
        info!(task_id = %task_id, "Controller pair stopped");
        true
    }

    /// Force-stop and respawn the pair; the worker inherits its session id
    /// and the mailbox is untouched.
    pub async fn restart_pair(&self, task: &Task) -> Result<()> {
        self.stop_pair(task.id).await;
        self.start_pair(task).await
    }

    pub async fn is_worker_live(&self, task_id: Uuid) -> bool {
        self.pairs
            .lock()
            .await
            .get(&task_id)
            .is_some_and(|p| !p.worker.handle.is_finished())
    }

    /// Tasks with a live worker; prunes finished entries on the way.
    pub async fn live_task_ids(&self) -> Vec<Uuid> {
        let mut pairs = self.pairs.lock().await;
        pairs.retain(|_, pair| {
            !pair.worker.handle.is_finished()
                || pair
                    .supervisor
                    .as_ref()
                    .is_some_and(|s| !s.handle.is_finished())
        });
        pairs
            .iter()
            .filter(|(_, pair)| !pair.worker.handle.is_finished())
            .map(|(id, _)| *id)
            .collect()
    }

    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.pairs.lock().await.keys().copied().collect();
        for id in ids {
            self.stop_pair(id).await;
        }
    }
}
