//! Connection entity model
//!
//! This module contains the SeaORM entity model for the connections table,
//! which stores one row per linked mailbox together with its sync cursor.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Connection entity representing a linked mailbox
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Mailbox address this connection is bound to (unique)
    pub email_address: String,

    /// Encrypted access token ciphertext (owned by the token collaborator)
    pub access_token_ciphertext: Option<Vec<u8>>,

    /// Encrypted refresh token ciphertext (owned by the token collaborator)
    pub refresh_token_ciphertext: Option<Vec<u8>>,

    /// Access token expiry timestamp
    pub token_expires_at: Option<DateTimeWithTimeZone>,

    /// Provider history cursor; preferred over date-based queries when present
    pub history_id: Option<String>,

    /// Timestamp of the last successful sync (date-query fallback anchor)
    pub last_synced_at: Option<DateTimeWithTimeZone>,

    /// Whether the connection participates in syncs
    pub is_active: bool,

    /// Timestamp when the connection was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the connection was last updated
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_job::Entity")]
    SyncJob,
    #[sea_orm(has_many = "super::processed_email::Entity")]
    ProcessedEmail,
    #[sea_orm(has_many = "super::subscription::Entity")]
    Subscription,
}

impl Related<super::sync_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJob.def()
    }
}

impl Related<super::processed_email::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProcessedEmail.def()
    }
}

impl Related<super::subscription::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subscription.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
