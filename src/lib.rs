//! # Subsync Library
//!
//! This library provides the core functionality for the subsync service:
//! incremental mailbox ingestion, LLM-backed subscription classification,
//! fuzzy deduplication, and the sync job lifecycle.

pub mod backoff;
pub mod classify;
pub mod config;
pub mod db;
pub mod dedupe;
pub mod error;
pub mod filter;
pub mod mailbox;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod repositories;
pub mod sweeper;
pub mod telemetry;
pub use migration;
