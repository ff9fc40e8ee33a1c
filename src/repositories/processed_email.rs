//! # Processed email repository
//!
//! Records the evaluation outcome for every message the pipeline touches.
//! The unique message id makes re-syncs idempotent: ids already present are
//! skipped before any fetch or classifier call. Rows are deleted only through
//! the explicit data reset.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, RuntimeErr, Set,
};
use tracing::debug;
use uuid::Uuid;

use crate::models::processed_email::{ActiveModel, Column, Entity, Model};

/// Outcome row for one evaluated message.
#[derive(Debug, Clone, Default)]
pub struct ProcessedEmailRecord {
    pub connection_id: Uuid,
    pub message_id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub is_subscription: bool,
    pub confidence: Option<f64>,
    pub vendor: Option<String>,
    pub email_type: Option<String>,
    pub error: Option<String>,
}

/// Repository for processed email database operations
pub struct ProcessedEmailRepository {
    db: DatabaseConnection,
}

impl ProcessedEmailRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Which of the given message ids already have an outcome row.
    pub async fn existing_ids(&self, ids: &[String]) -> Result<HashSet<String>, DbErr> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let rows = Entity::find()
            .filter(Column::MessageId.is_in(ids.iter().cloned()))
            .all(&self.db)
            .await?;

        Ok(rows.into_iter().map(|row| row.message_id).collect())
    }

    /// Record the outcome for one message.
    ///
    /// A unique violation on the message id means an overlapping run already
    /// recorded it; that is a skip, not an error.
    pub async fn record(&self, record: ProcessedEmailRecord) -> Result<Option<Model>, DbErr> {
        let row = ActiveModel {
            id: Set(Uuid::new_v4()),
            connection_id: Set(record.connection_id),
            message_id: Set(record.message_id.clone()),
            subject: Set(record.subject),
            sender: Set(record.sender),
            received_at: Set(record.received_at.map(Into::into)),
            processed_at: Set(Utc::now().fixed_offset()),
            is_subscription: Set(record.is_subscription),
            confidence: Set(record.confidence),
            vendor: Set(record.vendor),
            email_type: Set(record.email_type),
            error: Set(record.error),
        };

        match row.insert(&self.db).await {
            Ok(model) => Ok(Some(model)),
            Err(err) if is_unique_violation(&err) => {
                debug!(message_id = %record.message_id, "Message already recorded, skipping");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Attach a late classification result to an existing row. This is the
    /// only sanctioned post-insert mutation.
    pub async fn attach_result(
        &self,
        message_id: &str,
        is_subscription: bool,
        confidence: Option<f64>,
        vendor: Option<String>,
        email_type: Option<String>,
    ) -> Result<Option<Model>, DbErr> {
        let Some(row) = Entity::find()
            .filter(Column::MessageId.eq(message_id))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        let mut active: ActiveModel = row.into();
        active.is_subscription = Set(is_subscription);
        active.confidence = Set(confidence);
        active.vendor = Set(vendor);
        active.email_type = Set(email_type);
        active.error = Set(None);

        Ok(Some(active.update(&self.db).await?))
    }

    pub async fn count_for_connection(&self, connection_id: Uuid) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .count(&self.db)
            .await
    }

    /// Explicit data reset: drop every outcome row for the connection.
    pub async fn reset(&self, connection_id: Uuid) -> Result<u64, DbErr> {
        let result = Entity::delete_many()
            .filter(Column::ConnectionId.eq(connection_id))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

fn is_unique_violation(err: &DbErr) -> bool {
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err)))
        | DbErr::Query(RuntimeErr::SqlxError(sea_orm::SqlxError::Database(db_err))) => {
            db_err.is_unique_violation()
                || matches!(db_err.code().as_deref(), Some("23505") | Some("2067") | Some("1555"))
        }
        _ => false,
    }
}
