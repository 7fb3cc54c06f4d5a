//! libSQL backend — async `TaskStore`/`JobStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; `libsql::Connection` is `Send + Sync` and
//! safe for concurrent async use.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::job::{Job, JobPayload, JobRun, JobStatus, RunOutcome, Schedule};
use crate::store::migrations;
use crate::store::traits::{JobStore, TaskStore};
use crate::task::message::{MessageKind, TaskMessage, Tier};
use crate::task::model::{Task, TaskStatus, TimelineEntry, WatchdogState};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create database directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Raw SQL escape hatch for tests that need to poison rows.
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        self.conn
            .execute(sql, ())
            .await
            .map_err(|e| StoreError::Query(format!("execute_raw: {e}")))?;
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(ts: Option<DateTime<Utc>>) -> libsql::Value {
    opt_text_owned(ts.map(|t| t.to_rfc3339()))
}

fn corrupt(entity: &str, id: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        entity: entity.to_string(),
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

const TASK_COLUMNS: &str = "id, name, task_prompt, supervisor_instructions, status, created_at, \
    updated_at, completed_at, worker_session_id, supervisor_session_id, on_complete_hook, \
    check_interval_secs, supervise, last_activity_at, awaiting_input, completion_deferred, \
    completion_deferred_at, completion_deferred_summary, completion_deferred_detail, \
    supervisor_assessment_count, worker_exited_at, escalated_at, watchdog_state, restart_count, \
    fail_reason";

const MESSAGE_COLUMNS: &str = "id, task_id, ts, direction, sender, kind, content, detail, consumed";

const JOB_COLUMNS: &str =
    "id, name, schedule_kind, schedule_expr, payload, status, created_at, next_run_at, last_run_at";

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let id_str: String = row.get(0).map_err(|e| corrupt("task", "?", e))?;
    let id = Uuid::parse_str(&id_str).map_err(|e| corrupt("task", &id_str, e))?;

    let status_str: String = row.get(4).map_err(|e| corrupt("task", &id_str, e))?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(|e| corrupt("task", &id_str, e))?;

    let watchdog_str: String = row.get(22).map_err(|e| corrupt("task", &id_str, e))?;
    let watchdog_state: WatchdogState = watchdog_str
        .parse()
        .map_err(|e| corrupt("task", &id_str, e))?;

    let get_text = |i: i32| -> Result<String, StoreError> {
        row.get(i).map_err(|e| corrupt("task", &id_str, e))
    };
    let get_int = |i: i32| -> Result<i64, StoreError> {
        row.get(i).map_err(|e| corrupt("task", &id_str, e))
    };

    let created_str = get_text(5)?;
    let updated_str = get_text(6)?;
    let completed_str: Option<String> = row.get(7).ok();
    let last_activity_str = get_text(13)?;
    let deferred_at_str: Option<String> = row.get(16).ok();
    let worker_exited_str: Option<String> = row.get(20).ok();
    let escalated_str: Option<String> = row.get(21).ok();

    Ok(Task {
        id,
        name: get_text(1)?,
        task_prompt: get_text(2)?,
        supervisor_instructions: get_text(3)?,
        status,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(&completed_str),
        worker_session_id: row.get(8).ok(),
        supervisor_session_id: row.get(9).ok(),
        on_complete_hook: row.get(10).ok(),
        check_interval: Duration::from_secs(get_int(11)?.max(0) as u64),
        supervise: get_int(12)? != 0,
        last_activity_at: parse_datetime(&last_activity_str),
        awaiting_input: get_int(14)? != 0,
        completion_deferred: get_int(15)? != 0,
        completion_deferred_at: parse_optional_datetime(&deferred_at_str),
        completion_deferred_summary: get_text(17)?,
        completion_deferred_detail: get_text(18)?,
        supervisor_assessment_count: get_int(19)?.max(0) as u32,
        worker_exited_at: parse_optional_datetime(&worker_exited_str),
        escalated_at: parse_optional_datetime(&escalated_str),
        watchdog_state,
        restart_count: get_int(23)?.max(0) as u32,
        fail_reason: row.get(24).ok(),
    })
}

/// Map a libsql Row to a TaskMessage. Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<TaskMessage, StoreError> {
    let id_str: String = row.get(0).map_err(|e| corrupt("task_message", "?", e))?;
    let id = Uuid::parse_str(&id_str).map_err(|e| corrupt("task_message", &id_str, e))?;

    let task_id_str: String = row.get(1).map_err(|e| corrupt("task_message", &id_str, e))?;
    let task_id =
        Uuid::parse_str(&task_id_str).map_err(|e| corrupt("task_message", &id_str, e))?;

    let ts_str: String = row.get(2).map_err(|e| corrupt("task_message", &id_str, e))?;
    let sender_str: String = row.get(4).map_err(|e| corrupt("task_message", &id_str, e))?;
    let sender: Tier = sender_str
        .parse()
        .map_err(|e| corrupt("task_message", &id_str, e))?;
    let kind_str: String = row.get(5).map_err(|e| corrupt("task_message", &id_str, e))?;
    let kind: MessageKind = kind_str
        .parse()
        .map_err(|e| corrupt("task_message", &id_str, e))?;
    let content: String = row.get(6).map_err(|e| corrupt("task_message", &id_str, e))?;
    let detail: String = row.get(7).map_err(|e| corrupt("task_message", &id_str, e))?;
    let consumed: i64 = row.get(8).map_err(|e| corrupt("task_message", &id_str, e))?;

    Ok(TaskMessage {
        id,
        task_id,
        ts: parse_datetime(&ts_str),
        sender,
        kind,
        content,
        detail,
        consumed: consumed != 0,
    })
}

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, StoreError> {
    let id_str: String = row.get(0).map_err(|e| corrupt("job", "?", e))?;
    let id = Uuid::parse_str(&id_str).map_err(|e| corrupt("job", &id_str, e))?;

    let kind_str: String = row.get(2).map_err(|e| corrupt("job", &id_str, e))?;
    let expr_str: String = row.get(3).map_err(|e| corrupt("job", &id_str, e))?;
    let schedule =
        Schedule::from_db(&kind_str, &expr_str).map_err(|e| corrupt("job", &id_str, e))?;

    let payload_str: String = row.get(4).map_err(|e| corrupt("job", &id_str, e))?;
    let payload: JobPayload =
        serde_json::from_str(&payload_str).map_err(|e| corrupt("job", &id_str, e))?;

    let status_str: String = row.get(5).map_err(|e| corrupt("job", &id_str, e))?;
    let status: JobStatus = status_str.parse().map_err(|e| corrupt("job", &id_str, e))?;

    let created_str: String = row.get(6).map_err(|e| corrupt("job", &id_str, e))?;
    let next_str: Option<String> = row.get(7).ok();
    let last_str: Option<String> = row.get(8).ok();

    Ok(Job {
        id,
        name: row.get(1).map_err(|e| corrupt("job", &id_str, e))?,
        schedule,
        payload,
        status,
        created_at: parse_datetime(&created_str),
        next_run_at: parse_optional_datetime(&next_str),
        last_run_at: parse_optional_datetime(&last_str),
    })
}

fn row_to_run(row: &libsql::Row) -> Result<JobRun, StoreError> {
    let id_str: String = row.get(0).map_err(|e| corrupt("job_run", "?", e))?;
    let id = Uuid::parse_str(&id_str).map_err(|e| corrupt("job_run", &id_str, e))?;
    let job_id_str: String = row.get(1).map_err(|e| corrupt("job_run", &id_str, e))?;
    let job_id = Uuid::parse_str(&job_id_str).map_err(|e| corrupt("job_run", &id_str, e))?;
    let fired_str: String = row.get(2).map_err(|e| corrupt("job_run", &id_str, e))?;
    let outcome_str: String = row.get(3).map_err(|e| corrupt("job_run", &id_str, e))?;
    let outcome: RunOutcome = outcome_str
        .parse()
        .map_err(|e| corrupt("job_run", &id_str, e))?;

    Ok(JobRun {
        id,
        job_id,
        fired_at: parse_datetime(&fired_str),
        outcome,
        detail: row.get(4).map_err(|e| corrupt("job_run", &id_str, e))?,
    })
}

fn task_write_params(task: &Task) -> Vec<libsql::Value> {
    vec![
        libsql::Value::Text(task.id.to_string()),
        libsql::Value::Text(task.name.clone()),
        libsql::Value::Text(task.task_prompt.clone()),
        libsql::Value::Text(task.supervisor_instructions.clone()),
        libsql::Value::Text(task.status.as_str().to_string()),
        libsql::Value::Text(task.created_at.to_rfc3339()),
        libsql::Value::Text(task.updated_at.to_rfc3339()),
        opt_datetime(task.completed_at),
        opt_text_owned(task.worker_session_id.clone()),
        opt_text_owned(task.supervisor_session_id.clone()),
        opt_text_owned(task.on_complete_hook.clone()),
        libsql::Value::Integer(task.check_interval.as_secs() as i64),
        libsql::Value::Integer(task.supervise as i64),
        libsql::Value::Text(task.last_activity_at.to_rfc3339()),
        libsql::Value::Integer(task.awaiting_input as i64),
        libsql::Value::Integer(task.completion_deferred as i64),
        opt_datetime(task.completion_deferred_at),
        libsql::Value::Text(task.completion_deferred_summary.clone()),
        libsql::Value::Text(task.completion_deferred_detail.clone()),
        libsql::Value::Integer(task.supervisor_assessment_count as i64),
        opt_datetime(task.worker_exited_at),
        opt_datetime(task.escalated_at),
        libsql::Value::Text(task.watchdog_state.as_str().to_string()),
        libsql::Value::Integer(task.restart_count as i64),
        opt_text_owned(task.fail_reason.clone()),
    ]
}

// ── TaskStore implementation ────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                      ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)"
                ),
                task_write_params(task),
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_task: {e}")))?;
        debug!(task_id = %task.id, status = %task.status, "Task inserted");
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut values = task_write_params(task);
        // id moves to the WHERE clause
        let id = values.remove(0);
        values.push(id);
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET name = ?1, task_prompt = ?2, supervisor_instructions = ?3, \
                 status = ?4, created_at = ?5, updated_at = ?6, completed_at = ?7, \
                 worker_session_id = ?8, supervisor_session_id = ?9, on_complete_hook = ?10, \
                 check_interval_secs = ?11, supervise = ?12, last_activity_at = ?13, \
                 awaiting_input = ?14, completion_deferred = ?15, completion_deferred_at = ?16, \
                 completion_deferred_summary = ?17, completion_deferred_detail = ?18, \
                 supervisor_assessment_count = ?19, worker_exited_at = ?20, escalated_at = ?21, \
                 watchdog_state = ?22, restart_count = ?23, fail_reason = ?24 WHERE id = ?25",
                values,
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_task: {e}")))?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "task".into(),
                id: task.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_task: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_task: {e}")))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let mut rows = match status {
            Some(status) => self
                .conn()
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at DESC"
                    ),
                    params![status.as_str()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC"),
                    (),
                )
                .await,
        }
        .map_err(|e| StoreError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn append_message(&self, msg: &TaskMessage) -> Result<(), StoreError> {
        let direction = if msg.kind.is_inbound() {
            "inbound"
        } else {
            "outbound"
        };
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO task_messages ({MESSAGE_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    msg.id.to_string(),
                    msg.task_id.to_string(),
                    msg.ts.to_rfc3339(),
                    direction,
                    msg.sender.as_str(),
                    msg.kind.as_str(),
                    msg.content.clone(),
                    msg.detail.clone(),
                    msg.consumed as i64,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_message: {e}")))?;
        Ok(())
    }

    async fn unconsumed_inbound(&self, task_id: Uuid) -> Result<Vec<TaskMessage>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM task_messages \
                     WHERE task_id = ?1 AND direction = 'inbound' AND consumed = 0 \
                     ORDER BY ts ASC"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("unconsumed_inbound: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn mark_consumed(&self, ids: &[Uuid]) -> Result<(), StoreError> {
        for id in ids {
            self.conn()
                .execute(
                    "UPDATE task_messages SET consumed = 1 WHERE id = ?1",
                    params![id.to_string()],
                )
                .await
                .map_err(|e| StoreError::Query(format!("mark_consumed: {e}")))?;
        }
        Ok(())
    }

    async fn recent_messages(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TaskMessage>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM task_messages WHERE task_id = ?1 \
                     ORDER BY ts DESC LIMIT ?2"
                ),
                params![task_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("recent_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Skipping message row: {e}"),
            }
        }
        messages.reverse();
        Ok(messages)
    }

    async fn append_event(&self, task_id: Uuid, entry: &TimelineEntry) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO task_events (id, task_id, ts, event, summary, detail) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    task_id.to_string(),
                    entry.ts.to_rfc3339(),
                    entry.event.clone(),
                    entry.summary.clone(),
                    entry.detail.clone(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_event: {e}")))?;
        Ok(())
    }

    async fn timeline(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TimelineEntry>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT ts, event, summary, detail FROM ( \
                     SELECT ts, event, summary, detail FROM task_events WHERE task_id = ?1 \
                     UNION ALL \
                     SELECT ts, kind AS event, content AS summary, detail \
                     FROM task_messages WHERE task_id = ?1 \
                 ) ORDER BY ts DESC LIMIT ?2",
                params![task_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("timeline: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let ts_str: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("timeline row: {e}")))?;
            let event: String = row
                .get(1)
                .map_err(|e| StoreError::Query(format!("timeline row: {e}")))?;
            let summary: String = row
                .get(2)
                .map_err(|e| StoreError::Query(format!("timeline row: {e}")))?;
            let detail: String = row
                .get(3)
                .map_err(|e| StoreError::Query(format!("timeline row: {e}")))?;
            entries.push(TimelineEntry {
                ts: parse_datetime(&ts_str),
                event,
                summary,
                detail,
            });
        }
        entries.reverse();
        Ok(entries)
    }
}

// ── JobStore implementation ─────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| StoreError::Query(format!("insert_job payload: {e}")))?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    job.id.to_string(),
                    job.name.clone(),
                    job.schedule.kind_str(),
                    job.schedule.expr_string(),
                    payload,
                    job.status.as_str(),
                    job.created_at.to_rfc3339(),
                    opt_datetime(job.next_run_at),
                    opt_datetime(job.last_run_at),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_job: {e}")))?;
        debug!(job_id = %job.id, schedule = %job.schedule.expr_string(), "Job inserted");
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&job.payload)
            .map_err(|e| StoreError::Query(format!("update_job payload: {e}")))?;
        let affected = self
            .conn()
            .execute(
                "UPDATE jobs SET name = ?1, schedule_kind = ?2, schedule_expr = ?3, \
                 payload = ?4, status = ?5, next_run_at = ?6, last_run_at = ?7 WHERE id = ?8",
                params![
                    job.name.clone(),
                    job.schedule.kind_str(),
                    job.schedule.expr_string(),
                    payload,
                    job.status.as_str(),
                    opt_datetime(job.next_run_at),
                    opt_datetime(job.last_run_at),
                    job.id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_job: {e}")))?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "job".into(),
                id: job.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get_job: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC"),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs \
                     WHERE status = 'active' AND next_run_at IS NOT NULL AND next_run_at <= ?1 \
                     ORDER BY next_run_at ASC"
                ),
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("due_jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!("Skipping job row: {e}"),
            }
        }
        Ok(jobs)
    }

    async fn append_run(&self, run: &JobRun) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO job_runs (id, job_id, fired_at, outcome, detail) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.id.to_string(),
                    run.job_id.to_string(),
                    run.fired_at.to_rfc3339(),
                    run.outcome.as_str(),
                    run.detail.clone(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_run: {e}")))?;
        Ok(())
    }

    async fn list_runs(&self, job_id: Uuid, limit: usize) -> Result<Vec<JobRun>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, job_id, fired_at, outcome, detail FROM job_runs \
                 WHERE job_id = ?1 ORDER BY fired_at DESC LIMIT ?2",
                params![job_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_runs: {e}")))?;

        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_run(&row) {
                Ok(run) => runs.push(run),
                Err(e) => warn!("Skipping run row: {e}"),
            }
        }
        Ok(runs)
    }
}
