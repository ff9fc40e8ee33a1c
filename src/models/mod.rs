//! SeaORM entity models for the subsync service.

pub mod connection;
pub mod processed_email;
pub mod subscription;
pub mod sync_job;
