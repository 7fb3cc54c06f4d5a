//! End-to-end engine flows against an in-memory store and a quiet
//! session backend. Reports are driven through the engine surface, the
//! way a session-side shim would call it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use overseer::config::EngineConfig;
use overseer::engine::{Engine, SendAck};
use overseer::error::Error;
use overseer::runner::{PollOutcome, RunnerError, SessionBackend};
use overseer::scheduler::{JobPayload, Schedule};
use overseer::store::LibSqlBackend;
use overseer::task::manager::{ReportOutcome, TaskSpec};
use overseer::task::message::{InboundKind, OutboundKind, Tier};
use overseer::task::model::TaskStatus;
use uuid::Uuid;

/// Starts sessions that produce nothing and never exit on their own.
struct QuietBackend;

#[async_trait]
impl SessionBackend for QuietBackend {
    async fn start_session(
        &self,
        _prompt: &str,
        _resume_session_id: Option<&str>,
    ) -> Result<String, RunnerError> {
        Ok(Uuid::new_v4().to_string())
    }

    async fn poll(&self, _session_id: &str) -> Result<PollOutcome, RunnerError> {
        Ok(PollOutcome::default())
    }

    async fn send_input(&self, _session_id: &str, _text: &str) -> Result<(), RunnerError> {
        Ok(())
    }

    async fn terminate(&self, _session_id: &str) -> Result<(), RunnerError> {
        Ok(())
    }
}

async fn engine(require_approval: bool) -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.data_dir = dir.path().to_path_buf();
    config.require_approval = require_approval;
    config.poll_interval = Duration::from_millis(50);
    config.stop_grace = Duration::from_secs(2);
    let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    (Engine::new(config, backend, Arc::new(QuietBackend), None), dir)
}

async fn wait_for_status(engine: &Engine, id: Uuid, want: TaskStatus) -> TaskStatus {
    for _ in 0..100 {
        let view = engine.get_status(id, 50).await.unwrap();
        if view.task.status == want {
            return want;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine.get_status(id, 50).await.unwrap().task.status
}

#[tokio::test]
async fn supervised_completion_waits_for_the_verdict() {
    let (engine, _dir) = engine(false).await;
    let task = engine
        .create_task(TaskSpec::new("audit", "audit the logs"))
        .await
        .unwrap();
    assert_eq!(wait_for_status(&engine, task.id, TaskStatus::Running).await, TaskStatus::Running);

    // worker claims done; the task holds in running until the supervisor rules
    let effect = engine
        .report(task.id, Tier::Worker, OutboundKind::Completed, "all clean", "")
        .await
        .unwrap();
    assert_eq!(effect.outcome, ReportOutcome::Deferred);
    assert!(effect.new_status.is_none());
    let view = engine.get_status(task.id, 50).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Running);
    assert!(view.task.completion_deferred);

    let effect = engine
        .report(
            task.id,
            Tier::Supervisor,
            OutboundKind::Completed,
            "verified",
            "",
        )
        .await
        .unwrap();
    assert_eq!(effect.new_status, Some(TaskStatus::Completed));

    let view = engine.get_status(task.id, 50).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Completed);
    let events: Vec<_> = view.timeline.iter().map(|e| e.event.as_str()).collect();
    assert!(events.contains(&"completion_deferred"));

    engine.shutdown().await;
}

#[tokio::test]
async fn needs_input_blocks_the_worker_until_answered() {
    let (engine, _dir) = engine(false).await;
    let mut spec = TaskSpec::new("form", "fill the form");
    spec.supervise = false;
    let task = engine.create_task(spec).await.unwrap();
    wait_for_status(&engine, task.id, TaskStatus::Running).await;

    engine
        .report(
            task.id,
            Tier::Worker,
            OutboundKind::NeedsInput,
            "which account?",
            "",
        )
        .await
        .unwrap();
    let view = engine.get_status(task.id, 50).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::NeedsInput);
    assert!(view.task.awaiting_input);

    // worker chatter is rejected while the question stands
    let err = engine
        .report(task.id, Tier::Worker, OutboundKind::Progress, "still going", "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Task(_)));

    assert_eq!(
        engine
            .send(task.id, InboundKind::Input, "the prod account", "")
            .await
            .unwrap(),
        SendAck::Queued
    );
    let view = engine.get_status(task.id, 50).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Running);
    assert!(!view.task.awaiting_input);

    let effect = engine
        .report(task.id, Tier::Worker, OutboundKind::Completed, "submitted", "")
        .await
        .unwrap();
    assert_eq!(effect.new_status, Some(TaskStatus::Completed));

    engine.shutdown().await;
}

#[tokio::test]
async fn instruction_revives_a_cancelled_task_with_its_history() {
    let (engine, _dir) = engine(false).await;
    let mut spec = TaskSpec::new("rev", "long haul");
    spec.supervise = false;
    let task = engine.create_task(spec).await.unwrap();
    wait_for_status(&engine, task.id, TaskStatus::Running).await;
    let first_session = engine
        .get_status(task.id, 1)
        .await
        .unwrap()
        .task
        .worker_session_id
        .expect("running task has a worker session");

    engine.cancel(task.id).await.unwrap();
    let view = engine.get_status(task.id, 50).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Cancelled);

    // plain input cannot raise the dead
    assert!(engine
        .send(task.id, InboundKind::Input, "hello?", "")
        .await
        .is_err());

    assert_eq!(
        engine
            .send(task.id, InboundKind::Instruction, "pick it back up", "")
            .await
            .unwrap(),
        SendAck::Revived
    );
    let view = engine.get_status(task.id, 50).await.unwrap();
    assert_eq!(view.task.status, TaskStatus::Running);
    assert!(view.task.completed_at.is_none());
    let events: Vec<_> = view.timeline.iter().map(|e| e.event.as_str()).collect();
    assert!(events.contains(&"created"));
    assert!(events.contains(&"resumed"));

    // the fresh pair runs under a new session id
    let mut second_session = view.task.worker_session_id.clone();
    for _ in 0..100 {
        if second_session.as_deref() != Some(first_session.as_str()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        second_session = engine
            .get_status(task.id, 1)
            .await
            .unwrap()
            .task
            .worker_session_id;
    }
    let second_session = second_session.expect("revived task has a worker session");
    assert_ne!(second_session, first_session);

    engine.shutdown().await;
}

#[tokio::test]
async fn approval_gate_holds_the_task_until_approved() {
    let (engine, _dir) = engine(true).await;
    let task = engine
        .create_task(TaskSpec::new("risky", "delete old branches"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Proposed);
    assert!(task.worker_session_id.is_none());

    // inbound traffic other than cancel has nowhere to go yet
    assert!(engine
        .send(task.id, InboundKind::Input, "go", "")
        .await
        .is_err());

    engine.approve(task.id).await.unwrap();
    assert_eq!(wait_for_status(&engine, task.id, TaskStatus::Running).await, TaskStatus::Running);

    engine.shutdown().await;
}

#[tokio::test]
async fn fired_job_materializes_as_a_task() {
    let (engine, _dir) = engine(false).await;
    let at = chrono::Utc::now() + chrono::Duration::seconds(2);
    let mut payload = JobPayload::new("nightly", "rotate the reports");
    payload.supervise = false;
    let job = engine
        .schedule_job("nightly", Schedule::At(at), payload)
        .await
        .unwrap();

    let fired = engine
        .scheduler()
        .sweep_once(at + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(fired, 1);

    let tasks = engine.list_tasks(None).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].name, "nightly");
    wait_for_status(&engine, tasks[0].id, TaskStatus::Running).await;

    let runs = engine.list_job_runs(job.id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);

    engine.shutdown().await;
}
