//! Subscription entity model
//!
//! A detected recurring billing relationship for a mailbox. Created by the
//! pipeline on first detection of a new vendor; later syncs never overwrite a
//! record the user has verified.

use super::connection::Entity as Connection;
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

/// Subscription entity representing a recurring billing relationship
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "subscriptions")]
pub struct Model {
    /// Unique identifier for the subscription (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Connection (mailbox) the subscription was detected in
    pub connection_id: Uuid,

    /// Vendor display name
    pub vendor_name: String,

    /// Vendor billing email address
    pub vendor_email: Option<String>,

    /// Billing amount per cycle
    pub amount: Option<f64>,

    /// ISO currency code
    pub currency: Option<String>,

    /// Billing cycle (monthly, yearly, weekly, ...)
    pub billing_cycle: Option<String>,

    /// Next expected billing date
    pub next_billing_date: Option<DateTimeWithTimeZone>,

    /// Most recent observed billing date
    pub last_billing_date: Option<DateTimeWithTimeZone>,

    /// Subscription status (active, inactive, paused, unknown)
    pub status: String,

    /// Renewal type (auto-renew, manual, trial)
    pub renewal_type: Option<String>,

    /// Confidence score carried over from the detection
    pub confidence: Option<f64>,

    /// Category assigned by the classifier (streaming, software, ...)
    pub category: Option<String>,

    /// Free-form user notes
    pub notes: Option<String>,

    /// Set once the user has confirmed the record; blocks silent overwrites
    pub is_verified: bool,

    /// Timestamp when the subscription was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp when the subscription was last updated
    pub updated_at: DateTimeWithTimeZone,
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
