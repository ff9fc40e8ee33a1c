//! # Connection repository
//!
//! Store operations for linked mailboxes. The sync cursor (history id and
//! last-synced timestamp) is advanced here, and only at the end of a
//! successful sync run.

use chrono::{DateTime, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use crate::models::connection::{ActiveModel, Column, Entity, Model};

/// Repository for connection database operations
pub struct ConnectionRepository {
    db: DatabaseConnection,
}

impl ConnectionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Create a new mailbox connection.
    pub async fn create(
        &self,
        email_address: &str,
        access_token: Option<Vec<u8>>,
        refresh_token: Option<Vec<u8>>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();

        let connection = ActiveModel {
            id: Set(Uuid::new_v4()),
            email_address: Set(email_address.to_string()),
            access_token_ciphertext: Set(access_token),
            refresh_token_ciphertext: Set(refresh_token),
            token_expires_at: Set(token_expires_at.map(Into::into)),
            history_id: Set(None),
            last_synced_at: Set(None),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };

        connection.insert(&self.db).await
    }

    pub async fn find(&self, connection_id: Uuid) -> Result<Option<Model>, DbErr> {
        Entity::find_by_id(connection_id).one(&self.db).await
    }

    /// All active connections, oldest first.
    pub async fn list_active(&self) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::IsActive.eq(true))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }

    /// Advance the sync cursor after a successful run.
    ///
    /// Never called mid-run, so a crashed sync leaves the cursor at its
    /// pre-run value and the window is safe to retry.
    pub async fn advance_cursor(
        &self,
        connection_id: Uuid,
        history_id: Option<String>,
        synced_at: DateTime<Utc>,
    ) -> Result<Model, DbErr> {
        let connection = Entity::find_by_id(connection_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("connection {connection_id}")))?;

        let mut active: ActiveModel = connection.into();
        if let Some(history_id) = history_id {
            active.history_id = Set(Some(history_id));
        }
        active.last_synced_at = Set(Some(synced_at.fixed_offset()));
        active.updated_at = Set(Utc::now().fixed_offset());

        active.update(&self.db).await
    }

    /// Deactivate a connection so the scheduler skips it.
    pub async fn deactivate(&self, connection_id: Uuid) -> Result<Model, DbErr> {
        let connection = Entity::find_by_id(connection_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("connection {connection_id}")))?;

        let mut active: ActiveModel = connection.into();
        active.is_active = Set(false);
        active.updated_at = Set(Utc::now().fixed_offset());

        active.update(&self.db).await
    }
}
