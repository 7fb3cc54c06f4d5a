//! Worker controller — one tokio task per live worker session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::runner::{ExitReason, ProcessRunner};
use crate::task::manager::TaskManager;
use crate::task::message::{InboundKind, MessageKind, OutboundKind, TaskMessage, Tier};
use crate::task::model::Task;

/// Cooperative stop signal for a controller loop.
#[derive(Debug, Clone, Copy)]
pub enum ControlSignal {
    Stop,
}

pub struct WorkerController {
    task_id: Uuid,
    manager: Arc<TaskManager>,
    runner: Arc<ProcessRunner>,
    poll_interval: Duration,
}

impl WorkerController {
    pub fn new(
        task_id: Uuid,
        manager: Arc<TaskManager>,
        runner: Arc<ProcessRunner>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            task_id,
            manager,
            runner,
            poll_interval,
        }
    }

    pub async fn run(self, mut ctrl_rx: mpsc::Receiver<ControlSignal>) {
        if let Err(e) = self.run_inner(&mut ctrl_rx).await {
            error!(task_id = %self.task_id, "Worker controller stopped: {e}");
        }
    }

    async fn run_inner(&self, ctrl_rx: &mut mpsc::Receiver<ControlSignal>) -> Result<()> {
        let task = self.manager.get(self.task_id).await?;
        let prompt = self.build_prompt(&task).await?;
        let resume = task.worker_session_id.clone();

        let session_id = match self.runner.start(&prompt, resume.as_deref()).await {
            Ok(id) => id,
            Err(e) => {
                warn!(task_id = %self.task_id, "Worker session failed to spawn: {e}");
                let _ = self
                    .manager
                    .handle_report(
                        self.task_id,
                        Tier::Worker,
                        OutboundKind::Failed,
                        "crash",
                        &e.to_string(),
                    )
                    .await;
                return Err(e.into());
            }
        };
        self.manager
            .record_worker_session(self.task_id, &session_id)
            .await?;
        self.manager.mark_started(self.task_id).await?;

        let mut paused = false;
        let mut terminal_reported = false;

        loop {
            match ctrl_rx.try_recv() {
                Ok(ControlSignal::Stop) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    let _ = self.runner.terminate(&session_id).await;
                    return Ok(());
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            for msg in self.manager.check_inbox(self.task_id).await? {
                let MessageKind::Inbound(kind) = msg.kind else {
                    continue;
                };
                match kind {
                    InboundKind::Pause => paused = true,
                    InboundKind::Resume => paused = false,
                    InboundKind::Cancel | InboundKind::Terminate => {
                        let _ = self.runner.terminate(&session_id).await;
                        return Ok(());
                    }
                    InboundKind::Instruction | InboundKind::Input | InboundKind::Redirect => {
                        let text = format_inbound(&msg);
                        if let Err(e) = self.runner.send_input(&session_id, &text).await {
                            warn!(task_id = %self.task_id, "Failed to forward {kind}: {e}");
                        }
                    }
                }
            }

            if paused {
                // session stays alive but is left alone
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            let outcome = self.runner.poll(&session_id).await?;
            if !outcome.output.is_empty() {
                self.manager
                    .append_log(self.task_id, Tier::Worker, &outcome.output)
                    .await?;
                if outcome.reports.is_empty() {
                    let _ = self.manager.touch_activity(self.task_id).await;
                }
            }

            for report in &outcome.reports {
                match self
                    .manager
                    .handle_report(
                        self.task_id,
                        Tier::Worker,
                        report.kind,
                        &report.summary,
                        &report.detail,
                    )
                    .await
                {
                    Ok(effect) => {
                        if report.kind.is_terminal() {
                            terminal_reported = true;
                        }
                        if effect.new_status.is_some_and(|s| s.is_terminal()) {
                            let _ = self.runner.terminate(&session_id).await;
                            return Ok(());
                        }
                    }
                    Err(e) => debug!(task_id = %self.task_id, "Report rejected: {e}"),
                }
            }

            if outcome.exited {
                let _ = self.manager.mark_worker_exited(self.task_id).await;
                self.handle_exit(outcome.exit_reason, terminal_reported)
                    .await?;
                return Ok(());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Timeouts and crashes become `failed` reports; a clean exit leaves
    /// the verdict to the supervisor or watchdog.
    async fn handle_exit(
        &self,
        exit_reason: Option<ExitReason>,
        terminal_reported: bool,
    ) -> Result<()> {
        let reason = match exit_reason {
            Some(ExitReason::Timeout) => "timeout",
            Some(ExitReason::Crash) => "crash",
            _ => return Ok(()),
        };
        let task = self.manager.get(self.task_id).await?;
        if terminal_reported || task.completion_deferred || task.status.is_terminal() {
            return Ok(());
        }
        warn!(task_id = %self.task_id, reason, "Worker session died");
        let _ = self
            .manager
            .handle_report(
                self.task_id,
                Tier::Worker,
                OutboundKind::Failed,
                reason,
                &format!("worker session exited: {reason}"),
            )
            .await;
        Ok(())
    }

    /// Fresh starts get the task prompt; restarts and revivals also get
    /// recent mailbox history so the new session has context.
    async fn build_prompt(&self, task: &Task) -> Result<String> {
        let mut prompt = task.task_prompt.clone();
        if task.worker_session_id.is_some() {
            let ctx = self.manager.get_context(self.task_id, 10).await?;
            if !ctx.recent_messages.is_empty() {
                prompt.push_str("\n\nRecent task activity:\n");
                for msg in &ctx.recent_messages {
                    prompt.push_str(&format!("- [{}] {}: {}\n", msg.sender, msg.kind, msg.content));
                }
            }
            prompt.push_str("\nYou are picking this task back up. Continue where it left off.");
        }
        Ok(prompt)
    }
}

fn format_inbound(msg: &TaskMessage) -> String {
    if msg.detail.is_empty() {
        format!("[{}] {}", msg.kind, msg.content)
    } else {
        format!("[{}] {}\n{}", msg.kind, msg.content, msg.detail)
    }
}
