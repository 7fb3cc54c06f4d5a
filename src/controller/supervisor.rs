//! Supervisor controller — periodic assessment of a worker's task.
//!
//! Wakes every `check_interval`, builds a trigger prompt sized to the
//! situation and gives the session one bounded cycle to respond. The only
//! lever a supervisor has over the worker is the task mailbox; it never
//! touches the worker session directly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::controller::worker::ControlSignal;
use crate::error::Result;
use crate::runner::ProcessRunner;
use crate::task::manager::TaskManager;
use crate::task::message::Tier;
use crate::task::model::{Task, TaskStatus};

pub struct SupervisorController {
    task_id: Uuid,
    manager: Arc<TaskManager>,
    runner: Arc<ProcessRunner>,
    /// Upper bound on one assessment cycle.
    cycle_timeout: Duration,
    poll_interval: Duration,
}

impl SupervisorController {
    pub fn new(
        task_id: Uuid,
        manager: Arc<TaskManager>,
        runner: Arc<ProcessRunner>,
        cycle_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            task_id,
            manager,
            runner,
            cycle_timeout,
            poll_interval,
        }
    }

    pub async fn run(self, mut ctrl_rx: mpsc::Receiver<ControlSignal>) {
        if let Err(e) = self.run_inner(&mut ctrl_rx).await {
            error!(task_id = %self.task_id, "Supervisor controller stopped: {e}");
        }
    }

    async fn run_inner(&self, ctrl_rx: &mut mpsc::Receiver<ControlSignal>) -> Result<()> {
        let task = self.manager.get(self.task_id).await?;
        let check_interval = task.check_interval;
        let mut session_id: Option<String> = None;

        loop {
            tokio::select! {
                signal = ctrl_rx.recv() => {
                    match signal {
                        Some(ControlSignal::Stop) | None => {
                            if let Some(sid) = &session_id {
                                let _ = self.runner.terminate(sid).await;
                            }
                            return Ok(());
                        }
                    }
                }
                _ = tokio::time::sleep(check_interval) => {}
            }

            let task = self.manager.get(self.task_id).await?;
            if task.status.is_terminal() {
                if let Some(sid) = &session_id {
                    let _ = self.runner.terminate(sid).await;
                }
                return Ok(());
            }
            if task.status == TaskStatus::Paused {
                continue;
            }

            let sid = match &session_id {
                Some(sid) => sid.clone(),
                None => {
                    let seed = seed_prompt(&task);
                    let resume = task.supervisor_session_id.clone();
                    match self.runner.start(&seed, resume.as_deref()).await {
                        Ok(sid) => {
                            self.manager
                                .record_supervisor_session(self.task_id, &sid)
                                .await?;
                            session_id = Some(sid.clone());
                            sid
                        }
                        Err(e) => {
                            warn!(task_id = %self.task_id, "Supervisor session failed to spawn: {e}");
                            continue;
                        }
                    }
                }
            };

            let trigger = trigger_prompt(&task);
            if let Err(e) = self.runner.send_input(&sid, &trigger).await {
                warn!(task_id = %self.task_id, "Supervisor trigger failed: {e}");
                session_id = None;
                continue;
            }

            if !self.assessment_cycle(&sid).await? {
                session_id = None;
            }

            let task = self.manager.get(self.task_id).await?;
            if task.status.is_terminal() {
                if let Some(sid) = &session_id {
                    let _ = self.runner.terminate(sid).await;
                }
                return Ok(());
            }
        }
    }

    /// One bounded cycle: poll until the session emits a report, exits, or
    /// the cycle budget runs out. Returns false when the session is gone.
    async fn assessment_cycle(&self, session_id: &str) -> Result<bool> {
        let deadline = Instant::now() + self.cycle_timeout;
        while Instant::now() < deadline {
            let outcome = match self.runner.poll(session_id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!(task_id = %self.task_id, "Supervisor poll failed: {e}");
                    return Ok(false);
                }
            };
            if !outcome.output.is_empty() {
                self.manager
                    .append_log(self.task_id, Tier::Supervisor, &outcome.output)
                    .await?;
            }
            let mut reported = false;
            for report in &outcome.reports {
                reported = true;
                if let Err(e) = self
                    .manager
                    .handle_report(
                        self.task_id,
                        Tier::Supervisor,
                        report.kind,
                        &report.summary,
                        &report.detail,
                    )
                    .await
                {
                    debug!(task_id = %self.task_id, "Supervisor report rejected: {e}");
                }
            }
            if outcome.exited {
                return Ok(false);
            }
            if reported {
                return Ok(true);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        debug!(task_id = %self.task_id, "Assessment cycle hit its budget");
        Ok(true)
    }
}

fn seed_prompt(task: &Task) -> String {
    let mut prompt = format!(
        "You are supervising the background task \"{}\".\n\nTask goal:\n{}\n",
        task.name, task.task_prompt
    );
    if !task.supervisor_instructions.is_empty() {
        prompt.push_str(&format!(
            "\nSupervision guidance:\n{}\n",
            task.supervisor_instructions
        ));
    }
    prompt.push_str(
        "\nEach time you are triggered, review the task's recent activity and respond with \
         exactly one report: an assessment, an intervention, an escalation, or a final \
         completed/failed verdict when the worker's completion claim is under review.",
    );
    prompt
}

/// Contextual urgency: a deferred completion with a dead worker demands a
/// verdict now, a dead worker mid-task is a warning, a long-idle worker
/// gets a nudge, anything else is a routine check.
fn trigger_prompt(task: &Task) -> String {
    let worker_dead = task.worker_exited_at.is_some();
    if task.completion_deferred && worker_dead {
        format!(
            "The worker reported completion (\"{}\") and its session has exited. \
             You must issue your final verdict NOW: report completed or failed.",
            task.completion_deferred_summary
        )
    } else if task.completion_deferred {
        format!(
            "The worker reported completion: \"{}\". Verify the work and report \
             completed if it holds up, or failed if it does not.",
            task.completion_deferred_summary
        )
    } else if worker_dead && task.status == TaskStatus::Running {
        "The worker session has exited without a terminal report. Review the state of the \
         task and decide whether to intervene or escalate."
            .to_string()
    } else {
        let idle = (chrono::Utc::now() - task.last_activity_at)
            .to_std()
            .unwrap_or_default();
        if idle > task.check_interval * 2 {
            format!(
                "No worker activity for {}s. Check whether the worker is stuck and nudge it \
                 with an instruction if needed.",
                idle.as_secs()
            )
        } else {
            "Routine check. Review recent activity and report your assessment of progress."
                .to_string()
        }
    }
}
