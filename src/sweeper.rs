//! # Job health sweep
//!
//! Background task that recovers from crashed or wedged workers: jobs left in
//! a non-terminal state past the stuck timeout are force-failed with a
//! synthetic error, and terminal jobs older than the retention window are
//! purged. Runs independently of any single sync job.

use std::sync::Arc;

use chrono::Duration;
use metrics::{counter, histogram};
use sea_orm::DatabaseConnection;
use tokio::time::{Duration as TokioDuration, Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::config::SweepConfig;
use crate::repositories::sync_job::JobQueue;

/// Background sweeper service.
pub struct JobSweeper {
    config: SweepConfig,
    db: Arc<DatabaseConnection>,
}

impl JobSweeper {
    pub fn new(config: SweepConfig, db: Arc<DatabaseConnection>) -> Self {
        Self { config, db }
    }

    /// Run the sweep loop until the provided shutdown token fires.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            tick_seconds = self.config.tick_seconds,
            stuck_timeout_seconds = self.config.stuck_timeout_seconds,
            retention_days = self.config.retention_days,
            "Starting job health sweep"
        );
        let tick_interval = TokioDuration::from_secs(self.config.tick_seconds);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Job health sweep shutdown requested");
                    break;
                }
                _ = sleep(tick_interval) => {
                    let tick_started = Instant::now();
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "Sweep tick failed");
                    }
                    histogram!("job_sweep_tick_duration_ms")
                        .record(tick_started.elapsed().as_secs_f64() * 1_000.0);
                }
            }
        }

        info!("Job health sweep stopped");
    }

    /// One sweep pass: force-fail stuck jobs, purge expired terminal jobs.
    pub async fn tick(&self) -> Result<(), sea_orm::DbErr> {
        let queue = JobQueue::new(self.db.as_ref().clone());

        let stuck = queue
            .sweep_stuck(Duration::seconds(self.config.stuck_timeout_seconds as i64))
            .await?;
        counter!("job_sweep_stuck_failed_total").increment(stuck);

        let purged = queue
            .purge_terminal(Duration::days(self.config.retention_days as i64))
            .await?;
        counter!("job_sweep_purged_total").increment(purged);

        debug!(stuck, purged, "Sweep tick completed");
        Ok(())
    }
}
