//! Migration to create the processed_emails table.
//!
//! One row per mailbox message ever evaluated by the pipeline. The unique
//! index on the provider message id is the idempotence anchor for incremental
//! syncs with overlapping windows.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ProcessedEmails::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProcessedEmails::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ProcessedEmails::ConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(ProcessedEmails::MessageId).text().not_null())
                    .col(ColumnDef::new(ProcessedEmails::Subject).text().null())
                    .col(ColumnDef::new(ProcessedEmails::Sender).text().null())
                    .col(
                        ColumnDef::new(ProcessedEmails::ReceivedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ProcessedEmails::ProcessedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ProcessedEmails::IsSubscription)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(ProcessedEmails::Confidence).double().null())
                    .col(ColumnDef::new(ProcessedEmails::Vendor).text().null())
                    .col(ColumnDef::new(ProcessedEmails::EmailType).text().null())
                    .col(ColumnDef::new(ProcessedEmails::Error).text().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_processed_emails_connection_id")
                            .from(ProcessedEmails::Table, ProcessedEmails::ConnectionId)
                            .to(Connections::Table, Connections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_processed_emails_message_id")
                    .table(ProcessedEmails::Table)
                    .col(ProcessedEmails::MessageId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Per-connection listing in processing order.
        manager
            .create_index(
                Index::create()
                    .name("idx_processed_emails_connection_processed")
                    .table(ProcessedEmails::Table)
                    .col(ProcessedEmails::ConnectionId)
                    .col(ProcessedEmails::ProcessedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_processed_emails_message_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_processed_emails_connection_processed")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(ProcessedEmails::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ProcessedEmails {
    Table,
    Id,
    ConnectionId,
    MessageId,
    Subject,
    Sender,
    ReceivedAt,
    ProcessedAt,
    IsSubscription,
    Confidence,
    Vendor,
    EmailType,
    Error,
}

#[derive(DeriveIden)]
enum Connections {
    Table,
    Id,
}
