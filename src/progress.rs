//! Per-job sync progress pub/sub
//!
//! Advisory, in-process progress stream. Each job owns one broadcast channel
//! created on first use and dropped when the job reaches a terminal state, so
//! subscriber cleanup is structural and no state leaks across jobs. Nothing
//! here is persisted or load-bearing for pipeline correctness.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Broadcast buffer per job; slow subscribers lag rather than block the run.
const CHANNEL_CAPACITY: usize = 64;

/// Point-in-time projection of a job's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub job_id: Uuid,
    pub total_emails: i32,
    pub processed_emails: i32,
    pub subscriptions_found: i32,
    pub error_count: i32,
    /// Linear extrapolation from elapsed time; `None` until measurable.
    pub eta_seconds: Option<u64>,
}

/// Events pushed to progress subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Connected { job_id: Uuid },
    Progress(ProgressUpdate),
    Complete(ProgressUpdate),
    Error { job_id: Uuid, message: String },
}

/// In-process publish/subscribe of job progress.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    channels: Mutex<HashMap<Uuid, broadcast::Sender<ProgressEvent>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a job's progress stream.
    ///
    /// The channel is created lazily so observers may attach before the job
    /// publishes anything. Dropping the receiver unsubscribes.
    pub fn subscribe(&self, job_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        let mut channels = self.channels.lock().unwrap();
        let sender = channels
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let receiver = sender.subscribe();
        let _ = sender.send(ProgressEvent::Connected { job_id });
        receiver
    }

    /// Publish an intermediate progress update.
    pub fn publish(&self, update: ProgressUpdate) {
        let channels = self.channels.lock().unwrap();
        if let Some(sender) = channels.get(&update.job_id) {
            let _ = sender.send(ProgressEvent::Progress(update));
        }
    }

    /// Publish the final update and drop the job's channel.
    pub fn complete(&self, update: ProgressUpdate) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(sender) = channels.remove(&update.job_id) {
            let _ = sender.send(ProgressEvent::Complete(update));
        }
    }

    /// Publish a terminal error and drop the job's channel.
    pub fn error(&self, job_id: Uuid, message: impl Into<String>) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(sender) = channels.remove(&job_id) {
            let _ = sender.send(ProgressEvent::Error {
                job_id,
                message: message.into(),
            });
        }
    }

    /// Number of jobs with a live progress channel.
    pub fn active_jobs(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

/// Estimated seconds remaining, extrapolated linearly from throughput so far.
pub fn estimate_remaining_seconds(
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    processed: i32,
    total: i32,
) -> Option<u64> {
    if processed <= 0 || total <= processed {
        return None;
    }

    let elapsed = (now - started_at).num_milliseconds().max(0) as f64 / 1000.0;
    let per_email = elapsed / processed as f64;
    let remaining = (total - processed) as f64 * per_email;
    Some(remaining.round() as u64)
}
