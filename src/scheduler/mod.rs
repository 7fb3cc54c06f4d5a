//! Job scheduler — fires due jobs and records every firing.

pub mod job;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Error, JobError, Result};
use crate::store::JobStore;

pub use job::{Job, JobPayload, JobRun, JobStatus, RunOutcome, Schedule};

/// Where a fired job's payload goes. The engine delivers by creating and
/// starting a task; tests substitute their own sink.
#[async_trait]
pub trait JobDelivery: Send + Sync {
    /// Returns a short receipt for the run row (normally the task id).
    async fn deliver(&self, job: &Job) -> std::result::Result<String, JobError>;
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    delivery: Arc<dyn JobDelivery>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        delivery: Arc<dyn JobDelivery>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            delivery,
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
                        warn!("Scheduler sweep failed: {e}");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    pub async fn schedule(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        payload: JobPayload,
    ) -> Result<Job> {
        schedule.validate(Utc::now()).map_err(Error::Job)?;
        let job = Job::new(name, schedule, payload);
        self.store.insert_job(&job).await?;
        info!(job_id = %job.id, name = %job.name, next = ?job.next_run_at, "Job scheduled");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or(Error::Job(JobError::NotFound { id }))
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs().await?)
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        let mut job = self.get(id).await?;
        job.status = JobStatus::Cancelled;
        job.next_run_at = None;
        self.store.update_job(&job).await?;
        info!(job_id = %id, "Job cancelled");
        Ok(job)
    }

    pub async fn list_runs(&self, job_id: Uuid, limit: usize) -> Result<Vec<JobRun>> {
        self.get(job_id).await?;
        Ok(self.store.list_runs(job_id, limit).await?)
    }

    /// Fire everything due at `now`. One run row per firing; a delivery
    /// failure is recorded and never stops the sweep. Returns the number
    /// of jobs fired.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_jobs(now).await?;
        let mut fired = 0;
        for mut job in due {
            let run = match self.delivery.deliver(&job).await {
                Ok(receipt) => {
                    info!(job_id = %job.id, receipt, "Job delivered");
                    JobRun::new(job.id, RunOutcome::Delivered, receipt)
                }
                Err(e) => {
                    warn!(job_id = %job.id, "Job delivery failed: {e}");
                    JobRun::new(job.id, RunOutcome::Failed, e.to_string())
                }
            };
            self.store.append_run(&run).await?;

            job.last_run_at = Some(now);
            match job.schedule.next_fire(now) {
                Ok(Some(next)) => job.next_run_at = Some(next),
                Ok(None) => {
                    job.next_run_at = None;
                    job.status = JobStatus::Exhausted;
                }
                Err(e) => {
                    warn!(job_id = %job.id, "Schedule no longer computes: {e}");
                    job.next_run_at = None;
                    job.status = JobStatus::Exhausted;
                }
            }
            self.store.update_job(&job).await?;
            fired += 1;
        }
        Ok(fired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use std::sync::Mutex as StdMutex;

    struct RecordingDelivery {
        delivered: StdMutex<Vec<Uuid>>,
        fail_named: Option<String>,
    }

    impl RecordingDelivery {
        fn new() -> Self {
            Self {
                delivered: StdMutex::new(Vec::new()),
                fail_named: None,
            }
        }

        fn failing_for(name: &str) -> Self {
            Self {
                delivered: StdMutex::new(Vec::new()),
                fail_named: Some(name.to_string()),
            }
        }
    }

    #[async_trait]
    impl JobDelivery for RecordingDelivery {
        async fn deliver(&self, job: &Job) -> std::result::Result<String, JobError> {
            if self.fail_named.as_deref() == Some(job.name.as_str()) {
                return Err(JobError::Delivery {
                    id: job.id,
                    reason: "target unavailable".into(),
                });
            }
            self.delivered.lock().unwrap().push(job.id);
            Ok(format!("task-for-{}", job.name))
        }
    }

    async fn scheduler(delivery: RecordingDelivery) -> (Scheduler, Arc<RecordingDelivery>) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let delivery = Arc::new(delivery);
        (
            Scheduler::new(
                store,
                delivery.clone(),
                SchedulerConfig {
                    sweep_interval: std::time::Duration::from_secs(5),
                },
            ),
            delivery,
        )
    }

    #[tokio::test]
    async fn one_shot_fires_once_then_exhausts() {
        let (scheduler, delivery) = scheduler(RecordingDelivery::new()).await;
        let at = Utc::now() + chrono::Duration::seconds(5);
        let job = scheduler
            .schedule("once", Schedule::At(at), JobPayload::new("t", "p"))
            .await
            .unwrap();

        // not due yet
        assert_eq!(scheduler.sweep_once(Utc::now()).await.unwrap(), 0);

        let later = at + chrono::Duration::seconds(1);
        assert_eq!(scheduler.sweep_once(later).await.unwrap(), 1);
        assert_eq!(delivery.delivered.lock().unwrap().len(), 1);

        let job = scheduler.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Exhausted);
        assert!(job.next_run_at.is_none());
        assert_eq!(job.last_run_at, Some(later));

        // a later sweep finds nothing
        assert_eq!(
            scheduler
                .sweep_once(later + chrono::Duration::hours(1))
                .await
                .unwrap(),
            0
        );
        let runs = scheduler.list_runs(job.id, 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Delivered);
    }

    #[tokio::test]
    async fn cron_job_advances_to_the_next_boundary() {
        let (scheduler, _delivery) = scheduler(RecordingDelivery::new()).await;
        let job = scheduler
            .schedule(
                "hourly",
                Schedule::Cron("0 * * * *".into()),
                JobPayload::new("t", "p"),
            )
            .await
            .unwrap();
        let first_due = job.next_run_at.unwrap();

        let sweep_at = first_due + chrono::Duration::seconds(30);
        assert_eq!(scheduler.sweep_once(sweep_at).await.unwrap(), 1);

        let job = scheduler.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Active);
        let next = job.next_run_at.unwrap();
        assert!(next > sweep_at);
        assert_eq!(next.timestamp() % 3600, 0, "fires on the hour");

        // one run row per firing
        assert_eq!(scheduler.list_runs(job.id, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delivery_failure_is_recorded_and_sweep_continues() {
        let (scheduler, delivery) = scheduler(RecordingDelivery::failing_for("bad")).await;
        let at = Utc::now() + chrono::Duration::seconds(1);
        let bad = scheduler
            .schedule("bad", Schedule::At(at), JobPayload::new("t", "p"))
            .await
            .unwrap();
        let good = scheduler
            .schedule("good", Schedule::At(at), JobPayload::new("t", "p"))
            .await
            .unwrap();

        let later = at + chrono::Duration::seconds(1);
        assert_eq!(scheduler.sweep_once(later).await.unwrap(), 2);
        assert_eq!(delivery.delivered.lock().unwrap().as_slice(), &[good.id]);

        let bad_runs = scheduler.list_runs(bad.id, 10).await.unwrap();
        assert_eq!(bad_runs[0].outcome, RunOutcome::Failed);
        assert!(bad_runs[0].detail.contains("target unavailable"));
    }

    #[tokio::test]
    async fn cancelled_jobs_do_not_fire() {
        let (scheduler, delivery) = scheduler(RecordingDelivery::new()).await;
        let at = Utc::now() + chrono::Duration::seconds(1);
        let job = scheduler
            .schedule("c", Schedule::At(at), JobPayload::new("t", "p"))
            .await
            .unwrap();
        scheduler.cancel(job.id).await.unwrap();

        let later = at + chrono::Duration::seconds(1);
        assert_eq!(scheduler.sweep_once(later).await.unwrap(), 0);
        assert!(delivery.delivered.lock().unwrap().is_empty());
        assert_eq!(
            scheduler.get(job.id).await.unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn bad_schedules_never_persist() {
        let (scheduler, _delivery) = scheduler(RecordingDelivery::new()).await;
        assert!(scheduler
            .schedule(
                "past",
                Schedule::At(Utc::now() - chrono::Duration::hours(1)),
                JobPayload::new("t", "p"),
            )
            .await
            .is_err());
        assert!(scheduler
            .schedule(
                "mangled",
                Schedule::Cron("* * *".into()),
                JobPayload::new("t", "p"),
            )
            .await
            .is_err());
        assert!(scheduler.list().await.unwrap().is_empty());
    }
}
