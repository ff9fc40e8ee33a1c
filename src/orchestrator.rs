//! # Sync orchestrator
//!
//! Composes listing, fetching, filtering, classification, deduplication, and
//! persistence into one sync run. Per-email failures are recorded on the
//! message's outcome row and never abort the run; only credential failures
//! and errors outside the per-email scope fail the job. The connection's
//! sync cursor advances exclusively on successful completion.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use metrics::counter;
use sea_orm::{DatabaseConnection, DbErr};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::classify::ClassificationService;
use crate::config::SyncConfig;
use crate::dedupe::{DedupePolicy, VendorRecord};
use crate::error::SyncError;
use crate::filter::EmailFilter;
use crate::mailbox::{
    BatchFetchOptions, EmailContent, MessageSource, SyncWindow, batch_fetch,
};
use crate::models::connection;
use crate::models::sync_job::JobType;
use crate::progress::{ProgressTracker, ProgressUpdate, estimate_remaining_seconds};
use crate::repositories::connection::ConnectionRepository;
use crate::repositories::processed_email::{ProcessedEmailRecord, ProcessedEmailRepository};
use crate::repositories::subscription::SubscriptionRepository;
use crate::repositories::sync_job::{JobCounters, JobQueue, JobQueueError};

/// Summary returned to the trigger after a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub job_id: Uuid,
    pub total_emails: i32,
    pub processed_emails: i32,
    pub subscriptions_found: i32,
    pub error_count: i32,
    pub duplicates_suppressed: i32,
    pub already_processed: i32,
    pub elapsed_seconds: f64,
}

/// Errors that end a run before or instead of a completed job.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error(transparent)]
    Database(#[from] DbErr),
    #[error("sync job failed: {0}")]
    Fatal(SyncError),
}

enum RunFailure {
    Fatal(SyncError),
    Queue(JobQueueError),
    Database(DbErr),
}

impl From<DbErr> for RunFailure {
    fn from(err: DbErr) -> Self {
        RunFailure::Database(err)
    }
}

impl From<JobQueueError> for RunFailure {
    fn from(err: JobQueueError) -> Self {
        RunFailure::Queue(err)
    }
}

#[derive(Default)]
struct RunState {
    counters: JobCounters,
    duplicates_suppressed: i32,
    already_processed: i32,
}

/// End-to-end sync pipeline for one mailbox connection.
pub struct SyncOrchestrator {
    db: DatabaseConnection,
    source: Arc<dyn MessageSource>,
    classifier: ClassificationService,
    filter: EmailFilter,
    dedupe: DedupePolicy,
    tracker: Arc<ProgressTracker>,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(
        db: DatabaseConnection,
        source: Arc<dyn MessageSource>,
        classifier: ClassificationService,
        filter: EmailFilter,
        dedupe: DedupePolicy,
        tracker: Arc<ProgressTracker>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            source,
            classifier,
            filter,
            dedupe,
            tracker,
            config,
        }
    }

    /// Run one sync for the connection.
    ///
    /// Fails fast with a queue conflict while another job is in flight for
    /// the same connection.
    #[instrument(skip(self, conn), fields(connection_id = %conn.id, mode = %mode))]
    pub async fn run_sync(
        &self,
        conn: &connection::Model,
        mode: JobType,
    ) -> Result<SyncReport, OrchestratorError> {
        let started = std::time::Instant::now();
        let queue = JobQueue::new(self.db.clone());

        let job = queue.enqueue(conn.id, mode).await?;
        let job = queue.start(job.id).await?;
        info!(job_id = %job.id, "Sync job started");

        match self.execute(&queue, job.id, conn, mode).await {
            Ok(state) => {
                queue.complete(job.id, true, None).await?;

                let mut update = self.progress_update(job.id, &state, None);
                update.eta_seconds = Some(0);
                self.tracker.complete(update);

                counter!("sync_jobs_total", "outcome" => "completed").increment(1);
                counter!("subscriptions_detected_total")
                    .increment(state.counters.subscriptions_found.max(0) as u64);

                let report = SyncReport {
                    job_id: job.id,
                    total_emails: state.counters.total_emails,
                    processed_emails: state.counters.processed_emails,
                    subscriptions_found: state.counters.subscriptions_found,
                    error_count: state.counters.error_count,
                    duplicates_suppressed: state.duplicates_suppressed,
                    already_processed: state.already_processed,
                    elapsed_seconds: started.elapsed().as_secs_f64(),
                };
                info!(
                    job_id = %job.id,
                    total = report.total_emails,
                    processed = report.processed_emails,
                    found = report.subscriptions_found,
                    errors = report.error_count,
                    elapsed_s = report.elapsed_seconds,
                    "Sync job completed"
                );
                Ok(report)
            }
            Err(RunFailure::Fatal(err)) => {
                warn!(job_id = %job.id, error = %err, "Sync job failed");
                let error_json = serde_json::to_value(&err).unwrap_or_default();
                queue.complete(job.id, false, Some(error_json)).await?;
                self.tracker.error(job.id, err.to_string());
                counter!("sync_jobs_total", "outcome" => "failed").increment(1);
                Err(OrchestratorError::Fatal(err))
            }
            Err(RunFailure::Database(err)) => {
                warn!(job_id = %job.id, error = %err, "Sync job hit a storage error");
                let error_json = serde_json::json!({ "message": err.to_string() });
                queue.complete(job.id, false, Some(error_json)).await?;
                self.tracker.error(job.id, err.to_string());
                counter!("sync_jobs_total", "outcome" => "failed").increment(1);
                Err(OrchestratorError::Database(err))
            }
            Err(RunFailure::Queue(err)) => {
                warn!(job_id = %job.id, error = %err, "Sync job hit a queue error");
                let error_json = serde_json::json!({ "message": err.to_string() });
                queue.complete(job.id, false, Some(error_json)).await?;
                self.tracker.error(job.id, err.to_string());
                counter!("sync_jobs_total", "outcome" => "failed").increment(1);
                Err(OrchestratorError::Queue(err))
            }
        }
    }

    async fn execute(
        &self,
        queue: &JobQueue,
        job_id: Uuid,
        conn: &connection::Model,
        mode: JobType,
    ) -> Result<RunState, RunFailure> {
        let processed_repo = ProcessedEmailRepository::new(self.db.clone());
        let subscriptions = SubscriptionRepository::new(self.db.clone());
        let connections = ConnectionRepository::new(self.db.clone());
        let job_started = Utc::now();

        let window = self.window_for(conn, mode);
        let listing = self
            .source
            .list_since(&window)
            .await
            .map_err(RunFailure::Fatal)?;

        let mut state = RunState::default();

        let existing = processed_repo.existing_ids(&listing.ids).await?;
        let candidates: Vec<String> = listing
            .ids
            .iter()
            .filter(|id| !existing.contains(*id))
            .cloned()
            .collect();
        state.already_processed = (listing.ids.len() - candidates.len()) as i32;
        state.counters.total_emails = candidates.len() as i32;

        queue.update_progress(job_id, state.counters).await?;
        self.tracker.publish(self.progress_update(job_id, &state, Some(job_started)));

        let fetch_options = BatchFetchOptions {
            chunk_size: self.config.fetch_chunk_size,
            concurrency: self.config.fetch_concurrency,
            chunk_delay: std::time::Duration::from_millis(self.config.chunk_delay_ms),
        };
        let fetched = batch_fetch(self.source.clone(), &candidates, &fetch_options).await;

        let mut contents: HashMap<String, EmailContent> = fetched
            .successful
            .into_iter()
            .map(|email| (email.id.clone(), email))
            .collect();
        let mut fetch_errors: HashMap<String, SyncError> = fetched.failed.into_iter().collect();

        for message_id in &candidates {
            if let Some(email) = contents.remove(message_id) {
                self.process_message(&processed_repo, &subscriptions, conn, email, &mut state)
                    .await?;
            } else {
                let error = fetch_errors
                    .remove(message_id)
                    .unwrap_or_else(|| SyncError::transient("message content unavailable"));
                if error.is_job_fatal() {
                    return Err(RunFailure::Fatal(error));
                }

                processed_repo
                    .record(ProcessedEmailRecord {
                        connection_id: conn.id,
                        message_id: message_id.clone(),
                        error: Some(error.to_string()),
                        ..Default::default()
                    })
                    .await?;
                state.counters.error_count += 1;
            }

            state.counters.processed_emails += 1;

            let is_final = state.counters.processed_emails == state.counters.total_emails;
            if state.counters.processed_emails as usize % self.config.progress_every == 0 || is_final
            {
                queue.update_progress(job_id, state.counters).await?;
                self.tracker
                    .publish(self.progress_update(job_id, &state, Some(job_started)));
            }
        }

        connections
            .advance_cursor(conn.id, listing.latest_history_id, Utc::now())
            .await?;

        Ok(state)
    }

    /// Evaluate one fetched message: filter, classify, dedupe, persist.
    ///
    /// Every outcome lands in exactly one processed-email row; non-fatal
    /// errors are recorded on that row and the loop continues.
    async fn process_message(
        &self,
        processed_repo: &ProcessedEmailRepository,
        subscriptions: &SubscriptionRepository,
        conn: &connection::Model,
        email: EmailContent,
        state: &mut RunState,
    ) -> Result<(), RunFailure> {
        let mut record = ProcessedEmailRecord {
            connection_id: conn.id,
            message_id: email.id.clone(),
            subject: Some(email.subject.clone()),
            sender: Some(email.sender.clone()),
            received_at: email.received_at,
            ..Default::default()
        };

        if !self.filter.should_process(&email) {
            processed_repo.record(record).await?;
            return Ok(());
        }

        match self.classifier.classify(&email).await {
            Ok(Some(detection)) => {
                let candidate = VendorRecord {
                    name: &detection.vendor,
                    email: detection.vendor_email.as_deref(),
                    amount: detection.amount,
                };

                let existing = subscriptions
                    .candidates_for_vendor(conn.id, &detection.vendor)
                    .await?;
                let duplicate = existing.iter().any(|record| {
                    self.dedupe.is_duplicate(
                        &candidate,
                        &VendorRecord {
                            name: &record.vendor_name,
                            email: record.vendor_email.as_deref(),
                            amount: record.amount,
                        },
                    )
                });

                if duplicate {
                    state.duplicates_suppressed += 1;
                } else {
                    subscriptions.insert_detection(conn.id, &detection).await?;
                    state.counters.subscriptions_found += 1;
                }

                record.is_subscription = true;
                record.confidence = Some(detection.confidence);
                record.vendor = Some(detection.vendor);
                record.email_type = detection.email_type;
                processed_repo.record(record).await?;
            }
            Ok(None) => {
                processed_repo.record(record).await?;
            }
            Err(err) if err.is_job_fatal() => return Err(RunFailure::Fatal(err)),
            Err(err) => {
                record.error = Some(err.to_string());
                processed_repo.record(record).await?;
                state.counters.error_count += 1;
            }
        }

        Ok(())
    }

    fn window_for(&self, conn: &connection::Model, mode: JobType) -> SyncWindow {
        sync_window(&self.config, conn, mode)
    }

    fn progress_update(
        &self,
        job_id: Uuid,
        state: &RunState,
        started_at: Option<chrono::DateTime<Utc>>,
    ) -> ProgressUpdate {
        let eta_seconds = started_at.and_then(|started| {
            estimate_remaining_seconds(
                started,
                Utc::now(),
                state.counters.processed_emails,
                state.counters.total_emails,
            )
        });

        ProgressUpdate {
            job_id,
            total_emails: state.counters.total_emails,
            processed_emails: state.counters.processed_emails,
            subscriptions_found: state.counters.subscriptions_found,
            error_count: state.counters.error_count,
            eta_seconds,
        }
    }
}

/// Window sized by mode: bounded for manual/incremental, a larger bounded
/// lookback for onboarding. Prefers the connection's history cursor.
pub fn sync_window(
    config: &SyncConfig,
    conn: &connection::Model,
    mode: JobType,
) -> SyncWindow {
    let default_lookback = match mode {
        JobType::Initial => Duration::days(config.initial_lookback_days as i64),
        JobType::Incremental | JobType::Manual => {
            Duration::hours(config.incremental_lookback_hours as i64)
        }
    };
    let after = conn
        .last_synced_at
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|| Utc::now() - default_lookback);

    let max_messages = match mode {
        JobType::Initial => config.initial_max_messages,
        JobType::Incremental => config.incremental_max_messages,
        JobType::Manual => config.manual_max_messages,
    };

    SyncWindow {
        history_id: conn.history_id.clone(),
        after,
        max_messages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection_with(
        history_id: Option<&str>,
        last_synced_at: Option<chrono::DateTime<Utc>>,
    ) -> connection::Model {
        connection::Model {
            id: Uuid::new_v4(),
            email_address: "user@example.com".to_string(),
            access_token_ciphertext: None,
            refresh_token_ciphertext: None,
            token_expires_at: None,
            history_id: history_id.map(|s| s.to_string()),
            last_synced_at: last_synced_at.map(Into::into),
            is_active: true,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[test]
    fn incremental_window_prefers_history_cursor() {
        let conn = connection_with(Some("12345"), None);
        let window = sync_window(&SyncConfig::default(), &conn, JobType::Incremental);
        assert_eq!(window.history_id.as_deref(), Some("12345"));
        assert_eq!(window.max_messages, 100);
    }

    #[test]
    fn initial_window_uses_long_lookback() {
        let conn = connection_with(None, None);
        let window = sync_window(&SyncConfig::default(), &conn, JobType::Initial);
        assert!(window.after <= Utc::now() - Duration::days(179));
        assert_eq!(window.max_messages, 500);
    }

    #[test]
    fn fallback_anchors_at_last_synced_time() {
        let last_sync = Utc::now() - Duration::hours(3);
        let conn = connection_with(None, Some(last_sync));
        let window = sync_window(&SyncConfig::default(), &conn, JobType::Incremental);
        assert_eq!(window.after, last_sync);
    }
}
