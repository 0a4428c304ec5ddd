use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

use crate::SyncService;

struct RunningJob {
    sched: JobScheduler,
    job_id: Uuid,
}

/// Owns the repeating sync timer for one [`SyncService`].
pub struct Scheduler {
    service: Arc<SyncService>,
    interval: Duration,
    running: Mutex<Option<RunningJob>>,
}

impl Scheduler {
    pub fn new(service: Arc<SyncService>) -> Self {
        let interval = service.config().interval;
        Self {
            service,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Kicks off one tick right away, then one per interval.
    ///
    /// Returns `false` when the timer was already running.
    pub async fn start(&self) -> Result<bool> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(false);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let service = self.service.clone();
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                service.tick().await;
            })
        })
        .context("creating repeated sync job")?;
        let job_id = sched.add(job).await.context("adding sync job")?;
        sched.start().await.context("starting scheduler")?;

        let service = self.service.clone();
        tokio::spawn(async move {
            service.tick().await;
        });

        info!(interval_secs = self.interval.as_secs(), %job_id, "sync scheduler started");
        *running = Some(RunningJob { sched, job_id });
        Ok(true)
    }

    /// Cancels future ticks. A sync already in flight runs to completion.
    ///
    /// Returns `false` when the timer was not running.
    pub async fn stop(&self) -> Result<bool> {
        let Some(RunningJob { mut sched, job_id }) = self.running.lock().await.take() else {
            return Ok(false);
        };
        sched.remove(&job_id).await.context("removing sync job")?;
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown reported an error");
        }
        info!(%job_id, "sync scheduler stopped");
        Ok(true)
    }
}
