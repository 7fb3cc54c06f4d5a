//! Command-spawning session backend.
//!
//! Each session is one child process of a configured command. The prompt
//! goes in on stdin, stdout/stderr are streamed line by line, and lines
//! of the form `REPORT {json}` become structured reports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RunnerError;
use crate::runner::{ExitReason, PollOutcome, SessionBackend, SessionReport};

const REPORT_PREFIX: &str = "REPORT ";

/// How sessions are spawned.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Each session gets its own working directory under here.
    pub session_root: PathBuf,
}

struct CommandSession {
    child: Child,
    stdin: Option<ChildStdin>,
    lines_rx: mpsc::UnboundedReceiver<String>,
    readers: Vec<JoinHandle<()>>,
}

pub struct CommandBackend {
    config: CommandConfig,
    sessions: Mutex<HashMap<String, CommandSession>>,
}

impl CommandBackend {
    pub fn new(config: CommandConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

fn spawn_line_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

/// Split raw lines into structured reports and plain output.
fn classify_lines(lines: Vec<String>) -> (Vec<SessionReport>, Vec<String>) {
    let mut reports = Vec::new();
    let mut output = Vec::new();
    for line in lines {
        if let Some(json) = line.strip_prefix(REPORT_PREFIX) {
            match serde_json::from_str::<SessionReport>(json) {
                Ok(report) => {
                    reports.push(report);
                    continue;
                }
                Err(e) => {
                    warn!("Unparseable report line ({e}): {line}");
                }
            }
        }
        output.push(line);
    }
    (reports, output)
}

#[async_trait]
impl SessionBackend for CommandBackend {
    async fn start_session(
        &self,
        prompt: &str,
        resume_session_id: Option<&str>,
    ) -> Result<String, RunnerError> {
        let session_id = Uuid::new_v4().to_string();
        let dir = self.config.session_root.join(&session_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .current_dir(&dir)
            .env("OVERSEER_SESSION_ID", &session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(resume) = resume_session_id {
            cmd.env("OVERSEER_RESUME_SESSION", resume);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RunnerError::Spawn(format!("{}: {e}", self.config.program)))?;

        let (tx, lines_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_line_reader(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_line_reader(stderr, tx));
        }

        let mut stdin = child.stdin.take();
        if let Some(pipe) = stdin.as_mut() {
            pipe.write_all(prompt.as_bytes()).await?;
            pipe.write_all(b"\n").await?;
            pipe.flush().await?;
        }

        debug!(session_id, program = %self.config.program, "Session started");
        self.sessions.lock().await.insert(
            session_id.clone(),
            CommandSession {
                child,
                stdin,
                lines_rx,
                readers,
            },
        );
        Ok(session_id)
    }

    async fn poll(&self, session_id: &str) -> Result<PollOutcome, RunnerError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RunnerError::SessionNotFound {
                id: session_id.to_string(),
            })?;

        let status = session.child.try_wait()?;
        let mut lines = Vec::new();

        if let Some(status) = status {
            // Let the readers flush everything the process wrote on the
            // way out before draining.
            let mut session = sessions.remove(session_id).ok_or_else(|| {
                RunnerError::SessionNotFound {
                    id: session_id.to_string(),
                }
            })?;
            for handle in session.readers.drain(..) {
                let _ = handle.await;
            }
            while let Ok(line) = session.lines_rx.try_recv() {
                lines.push(line);
            }
            let (reports, output) = classify_lines(lines);
            let exit_reason = if status.success() {
                ExitReason::Completed
            } else {
                ExitReason::Crash
            };
            debug!(session_id, %exit_reason, code = ?status.code(), "Session exited");
            return Ok(PollOutcome {
                reports,
                output,
                exited: true,
                exit_reason: Some(exit_reason),
            });
        }

        while let Ok(line) = session.lines_rx.try_recv() {
            lines.push(line);
        }
        let (reports, output) = classify_lines(lines);
        Ok(PollOutcome {
            reports,
            output,
            exited: false,
            exit_reason: None,
        })
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), RunnerError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RunnerError::SessionNotFound {
                id: session_id.to_string(),
            })?;
        let stdin = session
            .stdin
            .as_mut()
            .ok_or_else(|| RunnerError::SessionNotFound {
                id: session_id.to_string(),
            })?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn terminate(&self, session_id: &str) -> Result<(), RunnerError> {
        let Some(mut session) = self.sessions.lock().await.remove(session_id) else {
            return Ok(());
        };
        if session.child.start_kill().is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(5), session.child.wait()).await;
        }
        for handle in session.readers.drain(..) {
            handle.abort();
        }
        debug!(session_id, "Session terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::message::OutboundKind;

    fn backend(dir: &std::path::Path) -> CommandBackend {
        CommandBackend::new(CommandConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "read _prompt; echo plain output; echo 'REPORT {\"type\":\"completed\",\"summary\":\"all done\"}'".into()],
            session_root: dir.to_path_buf(),
        })
    }

    async fn poll_until_exit(backend: &CommandBackend, sid: &str) -> PollOutcome {
        let mut merged = PollOutcome::default();
        for _ in 0..100 {
            let outcome = backend.poll(sid).await.unwrap();
            merged.reports.extend(outcome.reports);
            merged.output.extend(outcome.output);
            if outcome.exited {
                merged.exited = true;
                merged.exit_reason = outcome.exit_reason;
                return merged;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session never exited");
    }

    #[tokio::test]
    async fn report_lines_are_parsed_and_output_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let sid = backend.start_session("do it", None).await.unwrap();

        let outcome = poll_until_exit(&backend, &sid).await;
        assert_eq!(outcome.exit_reason, Some(ExitReason::Completed));
        assert_eq!(outcome.output, vec!["plain output".to_string()]);
        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].kind, OutboundKind::Completed);
        assert_eq!(outcome.reports[0].summary, "all done");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(CommandConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "read _; exit 3".into()],
            session_root: dir.path().to_path_buf(),
        });
        let sid = backend.start_session("p", None).await.unwrap();
        let outcome = poll_until_exit(&backend, &sid).await;
        assert_eq!(outcome.exit_reason, Some(ExitReason::Crash));
    }

    #[tokio::test]
    async fn input_reaches_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(CommandConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "read _prompt; read answer; echo \"got $answer\"".into()],
            session_root: dir.path().to_path_buf(),
        });
        let sid = backend.start_session("p", None).await.unwrap();
        backend.send_input(&sid, "forty-two").await.unwrap();
        let outcome = poll_until_exit(&backend, &sid).await;
        assert!(outcome.output.contains(&"got forty-two".to_string()));
    }

    #[tokio::test]
    async fn terminate_kills_and_forgets_the_session() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(CommandConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "sleep 300".into()],
            session_root: dir.path().to_path_buf(),
        });
        let sid = backend.start_session("p", None).await.unwrap();
        backend.terminate(&sid).await.unwrap();
        assert!(matches!(
            backend.poll(&sid).await,
            Err(RunnerError::SessionNotFound { .. })
        ));
        // terminating twice is fine
        backend.terminate(&sid).await.unwrap();
    }

    #[test]
    fn malformed_report_lines_fall_back_to_output() {
        let (reports, output) = classify_lines(vec![
            "REPORT {not json".to_string(),
            "REPORT {\"type\":\"progress\",\"summary\":\"ok\"}".to_string(),
        ]);
        assert_eq!(reports.len(), 1);
        assert_eq!(output.len(), 1);
    }
}
