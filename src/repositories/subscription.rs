//! # Subscription repository
//!
//! Store operations for detected subscriptions. The pipeline inserts a new
//! row only after duplicate suppression has cleared the candidate against
//! the connection's existing records.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

use crate::classify::Detection;
use crate::dedupe::normalize_vendor_name;
use crate::models::subscription::{ActiveModel, Column, Entity, Model};

/// Repository for subscription database operations
pub struct SubscriptionRepository {
    db: DatabaseConnection,
}

impl SubscriptionRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Existing records that could duplicate the given vendor, narrowed by a
    /// normalized vendor-name prefix before the fuzzy check runs.
    pub async fn candidates_for_vendor(
        &self,
        connection_id: Uuid,
        vendor_name: &str,
    ) -> Result<Vec<Model>, DbErr> {
        let rows = Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .order_by_asc(Column::VendorName)
            .all(&self.db)
            .await?;

        let normalized = normalize_vendor_name(vendor_name);
        let prefix: String = normalized.chars().take(3).collect();
        if prefix.is_empty() {
            return Ok(rows);
        }

        Ok(rows
            .into_iter()
            .filter(|row| normalize_vendor_name(&row.vendor_name).starts_with(&prefix))
            .collect())
    }

    /// Persist a fresh detection as a new subscription.
    pub async fn insert_detection(
        &self,
        connection_id: Uuid,
        detection: &Detection,
    ) -> Result<Model, DbErr> {
        let now = Utc::now().fixed_offset();

        let subscription = ActiveModel {
            id: Set(Uuid::new_v4()),
            connection_id: Set(connection_id),
            vendor_name: Set(detection.vendor.clone()),
            vendor_email: Set(detection.vendor_email.clone()),
            amount: Set(detection.amount),
            currency: Set(detection.currency.clone()),
            billing_cycle: Set(detection.billing_cycle.clone()),
            next_billing_date: Set(detection.next_billing_date.map(Into::into)),
            last_billing_date: Set(None),
            status: Set(detection.status.clone()),
            renewal_type: Set(detection.renewal_type.clone()),
            confidence: Set(Some(detection.confidence)),
            category: Set(detection.category.clone()),
            notes: Set(None),
            is_verified: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        };

        subscription.insert(&self.db).await
    }

    pub async fn list_for_connection(&self, connection_id: Uuid) -> Result<Vec<Model>, DbErr> {
        Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await
    }

    pub async fn count_for_connection(&self, connection_id: Uuid) -> Result<u64, DbErr> {
        Entity::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .count(&self.db)
            .await
    }
}
