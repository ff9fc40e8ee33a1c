//! Mailbox provider abstraction
//!
//! Defines the interface the pipeline uses to resolve candidate message ids
//! and fetch message content, hiding provider pagination and rate-limit
//! handling. One production implementation (Gmail) and injectable mocks for
//! tests.

pub mod gmail;
pub mod token;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::SyncError;

/// Fetched message content handed to the filter and classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailContent {
    /// Provider message id.
    pub id: String,
    pub subject: String,
    pub sender: String,
    /// Plain-text body; HTML-stripped when no text part exists.
    pub body: String,
    pub received_at: Option<DateTime<Utc>>,
}

/// Window for a candidate-id listing.
///
/// The history cursor is preferred when present; `after` anchors the
/// date-based fallback query.
#[derive(Debug, Clone)]
pub struct SyncWindow {
    pub history_id: Option<String>,
    pub after: DateTime<Utc>,
    pub max_messages: usize,
}

/// Result of a candidate-id listing.
#[derive(Debug, Clone, Default)]
pub struct MessageListing {
    /// Candidate message ids, newest first as returned by the provider.
    pub ids: Vec<String>,
    /// Cursor to persist once the sync completes successfully.
    pub latest_history_id: Option<String>,
}

/// Interface to the mailbox provider.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// List candidate message ids for the window.
    ///
    /// A stale or invalid history cursor must fall back to a date-based query
    /// internally instead of failing the sync.
    async fn list_since(&self, window: &SyncWindow) -> Result<MessageListing, SyncError>;

    /// Fetch full content for one message.
    async fn fetch(&self, message_id: &str) -> Result<EmailContent, SyncError>;
}

/// Tuning for [`batch_fetch`].
#[derive(Debug, Clone)]
pub struct BatchFetchOptions {
    /// Ids fetched per chunk.
    pub chunk_size: usize,
    /// Parallel fetches inside a chunk.
    pub concurrency: usize,
    /// Pause between chunks.
    pub chunk_delay: Duration,
}

impl Default for BatchFetchOptions {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            concurrency: 5,
            chunk_delay: Duration::from_millis(200),
        }
    }
}

/// Outcome of a batch fetch; per-id failures never abort the batch.
#[derive(Debug, Default)]
pub struct BatchFetchOutcome {
    /// Fetched content, in the order the ids were requested.
    pub successful: Vec<EmailContent>,
    /// Ids that failed, with the per-id error.
    pub failed: Vec<(String, SyncError)>,
}

/// Fetch `ids` in fixed-size chunks with bounded parallelism inside a chunk
/// and a short delay between chunks.
///
/// This is the partial-failure isolation boundary: a failed id lands in
/// `failed` and the remaining ids continue.
pub async fn batch_fetch(
    source: Arc<dyn MessageSource>,
    ids: &[String],
    options: &BatchFetchOptions,
) -> BatchFetchOutcome {
    let mut outcome = BatchFetchOutcome::default();
    let chunk_size = options.chunk_size.max(1);
    let chunk_count = ids.len().div_ceil(chunk_size);

    for (index, chunk) in ids.chunks(chunk_size).enumerate() {
        let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let mut tasks: JoinSet<(String, Result<EmailContent, SyncError>)> = JoinSet::new();

        for id in chunk {
            let source = source.clone();
            let semaphore = semaphore.clone();
            let id = id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = source.fetch(&id).await;
                (id, result)
            });
        }

        let mut results: HashMap<String, Result<EmailContent, SyncError>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    results.insert(id, result);
                }
                Err(err) => {
                    warn!(error = %err, "Fetch task panicked");
                }
            }
        }

        // Re-emit in request order so downstream persistence is deterministic.
        for id in chunk {
            match results.remove(id) {
                Some(Ok(content)) => outcome.successful.push(content),
                Some(Err(err)) => outcome.failed.push((id.clone(), err)),
                None => outcome.failed.push((
                    id.clone(),
                    SyncError::transient("fetch task aborted before completion"),
                )),
            }
        }

        if index + 1 < chunk_count && !options.chunk_delay.is_zero() {
            tokio::time::sleep(options.chunk_delay).await;
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FlakySource {
        fail_ids: Vec<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageSource for FlakySource {
        async fn list_since(&self, _window: &SyncWindow) -> Result<MessageListing, SyncError> {
            Ok(MessageListing::default())
        }

        async fn fetch(&self, message_id: &str) -> Result<EmailContent, SyncError> {
            self.calls.lock().unwrap().push(message_id.to_string());
            if self.fail_ids.iter().any(|id| id == message_id) {
                return Err(SyncError::transient("boom"));
            }
            Ok(EmailContent {
                id: message_id.to_string(),
                subject: format!("subject {message_id}"),
                sender: "sender@example.com".to_string(),
                body: String::new(),
                received_at: None,
            })
        }
    }

    #[tokio::test]
    async fn failed_ids_do_not_abort_the_batch() {
        let source = Arc::new(FlakySource {
            fail_ids: vec!["m2".to_string()],
            calls: Mutex::new(Vec::new()),
        });
        let ids: Vec<String> = ["m1", "m2", "m3"].iter().map(|s| s.to_string()).collect();

        let outcome = batch_fetch(source, &ids, &BatchFetchOptions::default()).await;

        assert_eq!(outcome.successful.len(), 2);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, "m2");
    }

    #[tokio::test]
    async fn results_preserve_request_order() {
        let source = Arc::new(FlakySource {
            fail_ids: Vec::new(),
            calls: Mutex::new(Vec::new()),
        });
        let ids: Vec<String> = (0..7).map(|i| format!("m{i}")).collect();

        let options = BatchFetchOptions {
            chunk_size: 3,
            concurrency: 2,
            chunk_delay: Duration::ZERO,
        };
        let outcome = batch_fetch(source, &ids, &options).await;

        let fetched: Vec<&str> = outcome
            .successful
            .iter()
            .map(|email| email.id.as_str())
            .collect();
        assert_eq!(fetched, vec!["m0", "m1", "m2", "m3", "m4", "m5", "m6"]);
    }
}
