//! Subprocess session layer.
//!
//! A [`SessionBackend`] knows how to start, poll and stop one kind of
//! worker/supervisor session. [`ProcessRunner`] wraps a backend with a
//! wall-clock budget so a hung session surfaces as a `timeout` exit
//! instead of hanging its controller forever.

pub mod command;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::task::message::OutboundKind;

pub use command::{CommandBackend, CommandConfig};
pub use crate::error::RunnerError;

/// A structured report emitted by a session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionReport {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub detail: String,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean exit.
    Completed,
    /// Died without a terminal report.
    Crash,
    /// Wall-clock budget exhausted.
    Timeout,
    /// Explicitly stopped.
    Terminated,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::Crash => "crash",
            ExitReason::Timeout => "timeout",
            ExitReason::Terminated => "terminated",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What one poll of a session produced.
#[derive(Debug, Clone, Default)]
pub struct PollOutcome {
    pub reports: Vec<SessionReport>,
    /// Raw output lines since the last poll.
    pub output: Vec<String>,
    pub exited: bool,
    pub exit_reason: Option<ExitReason>,
}

/// Adapter boundary for a concrete session mechanism.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Start a session around `prompt`. `resume_session_id` carries prior
    /// context forward; a fresh id is returned either way.
    async fn start_session(
        &self,
        prompt: &str,
        resume_session_id: Option<&str>,
    ) -> Result<String, RunnerError>;

    async fn poll(&self, session_id: &str) -> Result<PollOutcome, RunnerError>;

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), RunnerError>;

    async fn terminate(&self, session_id: &str) -> Result<(), RunnerError>;
}

/// Timeout-enforcing wrapper around a [`SessionBackend`].
pub struct ProcessRunner {
    backend: Arc<dyn SessionBackend>,
    timeout: Duration,
    started: Mutex<HashMap<String, Instant>>,
}

impl ProcessRunner {
    pub fn new(backend: Arc<dyn SessionBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            started: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(
        &self,
        prompt: &str,
        resume_session_id: Option<&str>,
    ) -> Result<String, RunnerError> {
        let session_id = self.backend.start_session(prompt, resume_session_id).await?;
        self.started
            .lock()
            .await
            .insert(session_id.clone(), Instant::now());
        Ok(session_id)
    }

    /// Poll the backend; an overrun terminates the session and comes back
    /// as a `timeout` exit.
    pub async fn poll(&self, session_id: &str) -> Result<PollOutcome, RunnerError> {
        let mut outcome = self.backend.poll(session_id).await?;
        if outcome.exited {
            self.started.lock().await.remove(session_id);
            return Ok(outcome);
        }

        let overran = {
            let started = self.started.lock().await;
            started
                .get(session_id)
                .is_some_and(|t| t.elapsed() >= self.timeout)
        };
        if overran {
            warn!(session_id, timeout = ?self.timeout, "Session exceeded wall-clock budget");
            if let Err(e) = self.backend.terminate(session_id).await {
                warn!(session_id, "Failed to terminate overrunning session: {e}");
            }
            self.started.lock().await.remove(session_id);
            outcome.exited = true;
            outcome.exit_reason = Some(ExitReason::Timeout);
        }
        Ok(outcome)
    }

    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<(), RunnerError> {
        self.backend.send_input(session_id, text).await
    }

    pub async fn terminate(&self, session_id: &str) -> Result<(), RunnerError> {
        self.started.lock().await.remove(session_id);
        self.backend.terminate(session_id).await
    }
}
