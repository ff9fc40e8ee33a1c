//! # Error Handling
//!
//! Shared error taxonomy for calls against the two external APIs (mailbox
//! provider and LLM provider). The kind decides retryability: rate limits and
//! transient transport failures are retried with backoff, credential failures
//! are fatal to the whole job, permanent failures are surfaced per call.

use serde::{Deserialize, Serialize};

/// Structured error for provider-facing operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    #[serde(flatten)]
    pub kind: SyncErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncErrorKind {
    /// Credential failure (expired/revoked token). Fatal to the running job.
    Unauthorized,
    /// Rate limited or quota exhausted, with an optional provider hint.
    RateLimited {
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
    /// Transient transport failure (5xx, connection errors).
    Transient,
    /// Non-retryable failure (4xx other than 429, malformed requests).
    Permanent,
}

impl SyncError {
    pub fn unauthorized<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Unauthorized,
            message: Some(message.into()),
        }
    }

    pub fn rate_limited(retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: SyncErrorKind::RateLimited { retry_after_secs },
            message: None,
        }
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Transient,
            message: Some(message.into()),
        }
    }

    pub fn permanent<S: Into<String>>(message: S) -> Self {
        Self {
            kind: SyncErrorKind::Permanent,
            message: Some(message.into()),
        }
    }

    /// Map an HTTP status plus body snippet into the taxonomy.
    ///
    /// 429 is rate limited, 401/403 are credential failures, remaining 4xx are
    /// permanent, everything else (5xx) is transient.
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            429 => SyncError::rate_limited(None),
            401 | 403 => SyncError::unauthorized(format!("HTTP {status}: {body}")),
            s if (400..500).contains(&s) => SyncError::permanent(format!("HTTP {s}: {body}")),
            s => SyncError::transient(format!("HTTP {s}: {body}")),
        }
    }

    /// Whether the retry loop may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            SyncErrorKind::RateLimited { .. } | SyncErrorKind::Transient
        )
    }

    /// Whether the error invalidates the whole job rather than one call.
    pub fn is_job_fatal(&self) -> bool {
        matches!(self.kind, SyncErrorKind::Unauthorized)
    }

    /// Provider-supplied retry hint, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self.kind {
            SyncErrorKind::RateLimited { retry_after_secs } => retry_after_secs,
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SyncErrorKind::Unauthorized => write!(f, "Unauthorized")?,
            SyncErrorKind::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited")?;
                if let Some(after) = retry_after_secs {
                    write!(f, " (retry after: {after}s)")?;
                }
            }
            SyncErrorKind::Transient => write!(f, "Transient error")?,
            SyncErrorKind::Permanent => write!(f, "Permanent error")?,
        }
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SyncError {}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            SyncError::transient(format!("network error: {err}"))
        } else if let Some(status) = err.status() {
            SyncError::from_http_status(status.as_u16(), err.to_string())
        } else {
            SyncError::transient(format!("request error: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        assert_eq!(
            SyncError::from_http_status(429, "slow down").kind,
            SyncErrorKind::RateLimited {
                retry_after_secs: None
            }
        );
        assert_eq!(
            SyncError::from_http_status(401, "expired").kind,
            SyncErrorKind::Unauthorized
        );
        assert_eq!(
            SyncError::from_http_status(400, "bad request").kind,
            SyncErrorKind::Permanent
        );
        assert_eq!(
            SyncError::from_http_status(503, "unavailable").kind,
            SyncErrorKind::Transient
        );
    }

    #[test]
    fn retryability() {
        assert!(SyncError::rate_limited(Some(30)).is_retryable());
        assert!(SyncError::transient("flaky").is_retryable());
        assert!(!SyncError::unauthorized("revoked").is_retryable());
        assert!(!SyncError::permanent("bad payload").is_retryable());
        assert!(SyncError::unauthorized("revoked").is_job_fatal());
        assert!(!SyncError::transient("flaky").is_job_fatal());
    }

    #[test]
    fn serializes_kind_tag() {
        let err = SyncError::rate_limited(Some(60));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json.get("type").unwrap(), "rate_limited");
        assert_eq!(json.get("retry_after_secs").unwrap(), 60);
    }
}
