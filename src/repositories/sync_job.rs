//! # Sync job queue
//!
//! Persists and transitions sync-job state. The single-flight invariant (at
//! most one pending/running job per connection) is enforced by the partial
//! unique index `idx_sync_jobs_single_flight`, so enqueueing is an atomic
//! conditional insert with no check-then-act window. Terminal states are
//! immutable; counters only move forward.

use chrono::{Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, RuntimeErr,
    Set,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::sync_job::{ActiveModel, Column, Entity, JobStatus, JobType, Model};

/// Index name backing the single-flight guard.
const SINGLE_FLIGHT_INDEX: &str = "idx_sync_jobs_single_flight";

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("a sync job is already active for connection {connection_id}")]
    Conflict { connection_id: Uuid },
    #[error("sync job {0} not found")]
    NotFound(Uuid),
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        to: JobStatus,
    },
    #[error(transparent)]
    Database(#[from] DbErr),
}

/// Progress counters reported by a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounters {
    pub total_emails: i32,
    pub processed_emails: i32,
    pub subscriptions_found: i32,
    pub error_count: i32,
}

/// Queue facade over the sync_jobs table.
pub struct JobQueue {
    db: DatabaseConnection,
}

impl JobQueue {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Reserve a job slot for the connection.
    ///
    /// Fails with [`JobQueueError::Conflict`] while another job for the same
    /// connection is pending or running.
    pub async fn enqueue(
        &self,
        connection_id: Uuid,
        job_type: JobType,
    ) -> Result<Model, JobQueueError> {
        let now = Utc::now().fixed_offset();

        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            connection_id: Set(connection_id),
            job_type: Set(job_type.as_str().to_string()),
            status: Set(JobStatus::Pending.as_str().to_string()),
            total_emails: Set(0),
            processed_emails: Set(0),
            subscriptions_found: Set(0),
            error_count: Set(0),
            started_at: Set(None),
            finished_at: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match job.insert(&self.db).await {
            Ok(model) => {
                info!(
                    connection_id = %connection_id,
                    job_id = %model.id,
                    job_type = %job_type,
                    "Sync job enqueued"
                );
                Ok(model)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(JobQueueError::Conflict { connection_id })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Transition a pending job to running.
    pub async fn start(&self, job_id: Uuid) -> Result<Model, JobQueueError> {
        let job = self.find_required(job_id).await?;
        self.guard_transition(&job, JobStatus::Running)?;

        let now = Utc::now().fixed_offset();
        let mut active: ActiveModel = job.into();
        active.status = Set(JobStatus::Running.as_str().to_string());
        active.started_at = Set(Some(now));
        active.updated_at = Set(now);

        Ok(active.update(&self.db).await?)
    }

    /// Update progress counters; values never move backwards.
    pub async fn update_progress(
        &self,
        job_id: Uuid,
        counters: JobCounters,
    ) -> Result<Model, JobQueueError> {
        let job = self.find_required(job_id).await?;

        let mut active: ActiveModel = job.clone().into();
        active.total_emails = Set(job.total_emails.max(counters.total_emails));
        active.processed_emails = Set(job.processed_emails.max(counters.processed_emails));
        active.subscriptions_found =
            Set(job.subscriptions_found.max(counters.subscriptions_found));
        active.error_count = Set(job.error_count.max(counters.error_count));
        active.updated_at = Set(Utc::now().fixed_offset());

        Ok(active.update(&self.db).await?)
    }

    /// Terminal transition to completed or failed.
    pub async fn complete(
        &self,
        job_id: Uuid,
        success: bool,
        error: Option<JsonValue>,
    ) -> Result<Model, JobQueueError> {
        let target = if success {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };

        let job = self.find_required(job_id).await?;
        self.guard_transition(&job, target)?;

        let now = Utc::now().fixed_offset();
        let mut active: ActiveModel = job.into();
        active.status = Set(target.as_str().to_string());
        active.finished_at = Set(Some(now));
        active.updated_at = Set(now);
        if let Some(error) = error {
            active.error = Set(Some(error));
        }

        Ok(active.update(&self.db).await?)
    }

    /// Terminal transition to cancelled.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Model, JobQueueError> {
        let job = self.find_required(job_id).await?;
        self.guard_transition(&job, JobStatus::Cancelled)?;

        let now = Utc::now().fixed_offset();
        let mut active: ActiveModel = job.into();
        active.status = Set(JobStatus::Cancelled.as_str().to_string());
        active.finished_at = Set(Some(now));
        active.updated_at = Set(now);

        Ok(active.update(&self.db).await?)
    }

    pub async fn find(&self, job_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(job_id).one(&self.db).await
    }

    /// Force-fail jobs stuck in a non-terminal state past the timeout.
    ///
    /// This is the crash-recovery path: a worker that died mid-run leaves its
    /// job in `running` forever, which would also wedge the single-flight
    /// guard for that connection.
    pub async fn sweep_stuck(&self, timeout: Duration) -> Result<u64, DbErr> {
        let now = Utc::now();
        let cutoff = (now - timeout).fixed_offset();
        let synthetic_error = serde_json::json!({
            "message": format!("job exceeded the {}s stuck timeout and was force-failed", timeout.num_seconds()),
            "swept_at": now.to_rfc3339(),
        });

        let result = Entity::update_many()
            .col_expr(
                Column::Status,
                Expr::value(JobStatus::Failed.as_str()),
            )
            .col_expr(Column::FinishedAt, Expr::value(now.fixed_offset()))
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .col_expr(Column::Error, Expr::value(synthetic_error))
            .filter(
                Column::Status
                    .eq(JobStatus::Running.as_str())
                    .and(Column::StartedAt.lte(cutoff))
                    .or(Column::Status
                        .eq(JobStatus::Pending.as_str())
                        .and(Column::CreatedAt.lte(cutoff))),
            )
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            warn!(count = result.rows_affected, "Force-failed stuck sync jobs");
        }

        Ok(result.rows_affected)
    }

    /// Delete terminal jobs older than the retention window.
    pub async fn purge_terminal(&self, retention: Duration) -> Result<u64, DbErr> {
        let cutoff = (Utc::now() - retention).fixed_offset();

        let result = Entity::delete_many()
            .filter(
                Column::Status
                    .is_in(vec![
                        JobStatus::Completed.as_str(),
                        JobStatus::Failed.as_str(),
                        JobStatus::Cancelled.as_str(),
                    ])
                    .and(Column::FinishedAt.lte(cutoff)),
            )
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected)
    }

    /// Operator emergency stop: force-fail every running job immediately.
    pub async fn fail_all_running(&self, reason: &str) -> Result<u64, DbErr> {
        let now = Utc::now();
        let error = serde_json::json!({
            "message": reason,
            "stopped_at": now.to_rfc3339(),
        });

        let result = Entity::update_many()
            .col_expr(Column::Status, Expr::value(JobStatus::Failed.as_str()))
            .col_expr(Column::FinishedAt, Expr::value(now.fixed_offset()))
            .col_expr(Column::UpdatedAt, Expr::value(now.fixed_offset()))
            .col_expr(Column::Error, Expr::value(error))
            .filter(Column::Status.eq(JobStatus::Running.as_str()))
            .exec(&self.db)
            .await?;

        if result.rows_affected > 0 {
            warn!(
                count = result.rows_affected,
                reason, "Emergency stop force-failed running jobs"
            );
        }

        Ok(result.rows_affected)
    }

    async fn find_required(&self, job_id: Uuid) -> Result<Model, JobQueueError> {
        self.find(job_id)
            .await?
            .ok_or(JobQueueError::NotFound(job_id))
    }

    fn guard_transition(&self, job: &Model, target: JobStatus) -> Result<(), JobQueueError> {
        let allowed = match JobStatus::parse(&job.status) {
            Some(current) if current.is_terminal() => false,
            Some(JobStatus::Pending) => true,
            Some(JobStatus::Running) => target != JobStatus::Running,
            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(JobQueueError::InvalidTransition {
                job_id: job.id,
                from: job.status.clone(),
                to: target,
            })
        }
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err)))
        | DbErr::Query(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err))) => {
            let code = db_err.code();
            let constraint = db_err.constraint();
            matches!(constraint, Some(SINGLE_FLIGHT_INDEX))
                || matches!(code.as_deref(), Some("23505") | Some("2067") | Some("1555"))
        }
        _ => false,
    }
}
