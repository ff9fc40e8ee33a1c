//! Migration to create the subscriptions table.
//!
//! A subscription row is a detected recurring billing relationship for a
//! mailbox. Rows are created by the pipeline on first detection of a new
//! vendor and mutated afterwards only by user edits or duplicate suppression.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Subscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Subscriptions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::ConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Subscriptions::VendorName).text().not_null())
                    .col(ColumnDef::new(Subscriptions::VendorEmail).text().null())
                    .col(ColumnDef::new(Subscriptions::Amount).double().null())
                    .col(ColumnDef::new(Subscriptions::Currency).text().null())
                    .col(ColumnDef::new(Subscriptions::BillingCycle).text().null())
                    .col(
                        ColumnDef::new(Subscriptions::NextBillingDate)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::LastBillingDate)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::Status)
                            .text()
                            .not_null()
                            .default("unknown"),
                    )
                    .col(ColumnDef::new(Subscriptions::RenewalType).text().null())
                    .col(ColumnDef::new(Subscriptions::Confidence).double().null())
                    .col(ColumnDef::new(Subscriptions::Category).text().null())
                    .col(ColumnDef::new(Subscriptions::Notes).text().null())
                    .col(
                        ColumnDef::new(Subscriptions::IsVerified)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Subscriptions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_subscriptions_connection_id")
                            .from(Subscriptions::Table, Subscriptions::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Candidate lookup is narrowed by connection and vendor name prefix.
        manager
            .create_index(
                Index::create()
                    .name("idx_subscriptions_connection_vendor")
                    .table(Subscriptions::Table)
                    .col(Subscriptions::ConnectionId)
                    .col(Subscriptions::VendorName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_subscriptions_connection_vendor")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Subscriptions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Subscriptions {
    Table,
    Id,
    ConnectionId,
    VendorName,
    VendorEmail,
    Amount,
    Currency,
    BillingCycle,
    NextBillingDate,
    LastBillingDate,
    Status,
    RenewalType,
    Confidence,
    Category,
    Notes,
    IsVerified,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
