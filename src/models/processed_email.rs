//! ProcessedEmail entity model
//!
//! One row per mailbox message ever evaluated by the pipeline. The provider
//! message id is globally unique and anchors idempotent re-syncs: a message
//! id already present is skipped without refetching or reclassifying.

use super::connection::Entity as Connection;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// ProcessedEmail entity recording the evaluation outcome for one message
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "processed_emails")]
pub struct Model {
    /// Unique identifier for the row (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Connection the message belongs to
    pub connection_id: Uuid,

    /// Provider message id (unique; the idempotence anchor)
    pub message_id: String,

    /// Message subject as fetched
    pub subject: Option<String>,

    /// Message sender as fetched
    pub sender: Option<String>,

    /// Timestamp the message was received by the mailbox
    pub received_at: Option<DateTimeWithTimeZone>,

    /// Timestamp the pipeline evaluated the message
    pub processed_at: DateTimeWithTimeZone,

    /// Classification outcome
    pub is_subscription: bool,

    /// Model-reported confidence for the classification
    pub confidence: Option<f64>,

    /// Vendor name extracted by the classifier
    pub vendor: Option<String>,

    /// Email type reported by the classifier (receipt, renewal, trial, ...)
    pub email_type: Option<String>,

    /// Per-message error string when fetch or classification failed
    pub error: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "Connection",
        from = "Column::ConnectionId",
        to = "super::connection::Column::Id"
    )]
    Connection,
}

impl Related<Connection> for Entity {
    fn to() -> RelationDef {
        Relation::Connection.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
