//! LLM email classification
//!
//! Builds a fixed prompt around one email, requests a structured JSON
//! verdict, and gates the result on the model's reported confidence.
//! Malformed output and `is_subscription=false` both mean "no detection";
//! only transport-level failures surface as errors.

pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backoff::RetryPolicy;
use crate::config::LlmConfig;
use crate::error::SyncError;
use crate::mailbox::EmailContent;

/// Confidence assumed when the model omits one; sits below the default gate.
const DEFAULT_CONFIDENCE: f64 = 0.5;

/// One chat call against the LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
}

/// Raw transport result plus usage accounting.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// Transport abstraction over the LLM provider; swappable in tests.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, SyncError>;
}

/// Structured verdict expected back from the model.
#[derive(Debug, Deserialize)]
struct RawClassification {
    is_subscription: bool,
    vendor: Option<String>,
    vendor_email: Option<String>,
    amount: Option<f64>,
    currency: Option<String>,
    billing_cycle: Option<String>,
    next_billing_date: Option<String>,
    email_type: Option<String>,
    renewal_type: Option<String>,
    status: Option<String>,
    category: Option<String>,
    confidence: Option<f64>,
}

/// Accepted subscription detection for one email.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub vendor: String,
    pub vendor_email: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub billing_cycle: Option<String>,
    pub next_billing_date: Option<DateTime<Utc>>,
    pub email_type: Option<String>,
    pub renewal_type: Option<String>,
    pub status: String,
    pub category: Option<String>,
    pub confidence: f64,
}

const SYSTEM_PROMPT: &str = "You are an assistant that decides whether an email \
documents a recurring paid subscription (streaming, software, membership, or any \
other recurring billing relationship).\n\
Respond with a single JSON object and nothing else, using these fields:\n\
{\"is_subscription\": bool, \"vendor\": string|null, \"vendor_email\": string|null, \
\"amount\": number|null, \"currency\": string|null, \"billing_cycle\": \
\"weekly\"|\"monthly\"|\"yearly\"|null, \"next_billing_date\": \"YYYY-MM-DD\"|null, \
\"email_type\": \"receipt\"|\"renewal\"|\"trial\"|\"cancellation\"|null, \
\"renewal_type\": \"auto-renew\"|\"manual\"|null, \"status\": \
\"active\"|\"inactive\"|\"paused\"|\"unknown\"|null, \"category\": string|null, \
\"confidence\": number}\n\
One-off purchases, shipping notices, and newsletters are not subscriptions.\n\
\n\
Examples:\n\
Subject: Your Spotify Premium receipt\n\
From: no-reply@spotify.com\n\
-> {\"is_subscription\": true, \"vendor\": \"Spotify\", \"vendor_email\": \
\"no-reply@spotify.com\", \"amount\": 9.99, \"currency\": \"USD\", \
\"billing_cycle\": \"monthly\", \"next_billing_date\": null, \"email_type\": \
\"receipt\", \"renewal_type\": \"auto-renew\", \"status\": \"active\", \
\"category\": \"music\", \"confidence\": 0.95}\n\
Subject: Your order has shipped\n\
From: orders@amazon.com\n\
-> {\"is_subscription\": false, \"vendor\": null, \"vendor_email\": null, \
\"amount\": null, \"currency\": null, \"billing_cycle\": null, \
\"next_billing_date\": null, \"email_type\": null, \"renewal_type\": null, \
\"status\": null, \"category\": null, \"confidence\": 0.9}";

/// Classifies emails through an injected [`ChatTransport`].
pub struct ClassificationService {
    transport: Arc<dyn ChatTransport>,
    config: LlmConfig,
    retry: RetryPolicy,
}

impl ClassificationService {
    pub fn new(transport: Arc<dyn ChatTransport>, config: LlmConfig, retry: RetryPolicy) -> Self {
        Self {
            transport,
            config,
            retry,
        }
    }

    /// Classify one email.
    ///
    /// `Ok(None)` covers "no subscription detected" in all its forms:
    /// an explicit negative, malformed model output, or a confidence below
    /// the configured gate. `Err` is reserved for transport failures.
    pub async fn classify(&self, email: &EmailContent) -> Result<Option<Detection>, SyncError> {
        let request = self.build_request(email);

        let outcome = self
            .retry
            .retry("llm.classify", || self.transport.chat(request.clone()))
            .await?;

        record_usage(&outcome);

        let Some(raw) = parse_classification(&outcome.content) else {
            warn!(message_id = %email.id, "Unparseable classifier output, treating as no detection");
            return Ok(None);
        };

        Ok(self.accept(email, raw))
    }

    fn build_request(&self, email: &EmailContent) -> ChatRequest {
        let body: String = email.body.chars().take(self.config.max_body_chars).collect();
        let received = email
            .received_at
            .map(|at| at.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());

        ChatRequest {
            system: SYSTEM_PROMPT.to_string(),
            user: format!(
                "Subject: {}\nFrom: {}\nDate: {}\nBody:\n{}",
                email.subject, email.sender, received, body
            ),
        }
    }

    fn accept(&self, email: &EmailContent, raw: RawClassification) -> Option<Detection> {
        if !raw.is_subscription {
            return None;
        }

        let vendor = raw.vendor.filter(|v| !v.trim().is_empty())?;

        let confidence = raw.confidence.unwrap_or(DEFAULT_CONFIDENCE);
        if confidence < self.config.confidence_threshold {
            debug!(
                message_id = %email.id,
                vendor,
                confidence,
                threshold = self.config.confidence_threshold,
                "Detection below confidence gate"
            );
            return None;
        }

        Some(Detection {
            vendor,
            vendor_email: raw.vendor_email.filter(|v| !v.trim().is_empty()),
            amount: raw.amount,
            currency: raw.currency,
            billing_cycle: raw.billing_cycle,
            next_billing_date: raw.next_billing_date.as_deref().and_then(parse_date),
            email_type: raw.email_type,
            renewal_type: raw.renewal_type,
            status: raw.status.unwrap_or_else(|| "active".to_string()),
            category: raw.category,
            confidence,
        })
    }
}

/// Parse the model's JSON verdict, tolerating markdown code fences.
fn parse_classification(content: &str) -> Option<RawClassification> {
    let trimmed = content.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    serde_json::from_str(stripped).ok()
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

/// Record token usage for cost observability; recording never affects the
/// classification outcome.
fn record_usage(outcome: &ChatOutcome) {
    counter!("llm_calls_total").increment(1);
    if let Some(prompt) = outcome.prompt_tokens {
        counter!("llm_tokens_total", "kind" => "prompt").increment(prompt);
    }
    if let Some(completion) = outcome.completion_tokens {
        counter!("llm_tokens_total", "kind" => "completion").increment(completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        responses: Mutex<Vec<Result<ChatOutcome, SyncError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<ChatOutcome, SyncError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }

        fn text(content: &str) -> Result<ChatOutcome, SyncError> {
            Ok(ChatOutcome {
                content: content.to_string(),
                prompt_tokens: Some(120),
                completion_tokens: Some(40),
            })
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn chat(&self, _request: ChatRequest) -> Result<ChatOutcome, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(SyncError::permanent("script exhausted"));
            }
            responses.remove(0)
        }
    }

    fn service(transport: ScriptedTransport) -> ClassificationService {
        ClassificationService::new(
            Arc::new(transport),
            LlmConfig::default(),
            RetryPolicy {
                jitter_factor: 0.0,
                ..RetryPolicy::default()
            },
        )
    }

    fn netflix_email() -> EmailContent {
        EmailContent {
            id: "m1".to_string(),
            subject: "Your Netflix payment was processed".to_string(),
            sender: "billing@netflix.com".to_string(),
            body: "We charged $15.99. Next billing date March 15, 2024.".to_string(),
            received_at: None,
        }
    }

    const NETFLIX_VERDICT: &str = r#"{
        "is_subscription": true,
        "vendor": "Netflix",
        "vendor_email": "billing@netflix.com",
        "amount": 15.99,
        "currency": "USD",
        "billing_cycle": "monthly",
        "next_billing_date": "2024-03-15",
        "email_type": "receipt",
        "renewal_type": "auto-renew",
        "status": "active",
        "category": "streaming",
        "confidence": 0.93
    }"#;

    #[tokio::test]
    async fn accepts_confident_detection() {
        let service = service(ScriptedTransport::new(vec![ScriptedTransport::text(
            NETFLIX_VERDICT,
        )]));

        let detection = service.classify(&netflix_email()).await.unwrap().unwrap();
        assert_eq!(detection.vendor, "Netflix");
        assert_eq!(detection.amount, Some(15.99));
        assert_eq!(detection.billing_cycle.as_deref(), Some("monthly"));
        assert_eq!(detection.status, "active");
        assert_eq!(
            detection.next_billing_date.unwrap().format("%Y-%m-%d").to_string(),
            "2024-03-15"
        );
    }

    #[tokio::test]
    async fn negative_verdict_is_no_detection() {
        let service = service(ScriptedTransport::new(vec![ScriptedTransport::text(
            r#"{"is_subscription": false, "confidence": 0.9}"#,
        )]));

        assert!(service.classify(&netflix_email()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_output_is_no_detection_not_error() {
        let service = service(ScriptedTransport::new(vec![ScriptedTransport::text(
            "I think this is probably a subscription!",
        )]));

        assert!(service.classify(&netflix_email()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn code_fenced_json_is_parsed() {
        let fenced = format!("```json\n{NETFLIX_VERDICT}\n```");
        let service = service(ScriptedTransport::new(vec![ScriptedTransport::text(
            &fenced,
        )]));

        assert!(service.classify(&netflix_email()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn low_confidence_is_gated() {
        let service = service(ScriptedTransport::new(vec![ScriptedTransport::text(
            r#"{"is_subscription": true, "vendor": "Netflix", "confidence": 0.4}"#,
        )]));

        assert!(service.classify(&netflix_email()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_confidence_defaults_below_gate() {
        let service = service(ScriptedTransport::new(vec![ScriptedTransport::text(
            r#"{"is_subscription": true, "vendor": "Netflix"}"#,
        )]));

        assert!(service.classify(&netflix_email()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_vendor_is_no_detection() {
        let service = service(ScriptedTransport::new(vec![ScriptedTransport::text(
            r#"{"is_subscription": true, "vendor": "", "confidence": 0.9}"#,
        )]));

        assert!(service.classify(&netflix_email()).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_retried_until_success() {
        let transport = ScriptedTransport::new(vec![
            Err(SyncError::rate_limited(None)),
            Err(SyncError::rate_limited(None)),
            ScriptedTransport::text(NETFLIX_VERDICT),
        ]);
        let service = service(transport);

        let detection = service.classify(&netflix_email()).await.unwrap();
        assert!(detection.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhaust_after_ceiling() {
        let transport = ScriptedTransport::new(vec![
            Err(SyncError::rate_limited(None)),
            Err(SyncError::rate_limited(None)),
            Err(SyncError::rate_limited(None)),
            ScriptedTransport::text(NETFLIX_VERDICT),
        ]);
        let service = ClassificationService::new(
            Arc::new(transport),
            LlmConfig::default(),
            RetryPolicy {
                max_attempts: 3,
                jitter_factor: 0.0,
                ..RetryPolicy::default()
            },
        );

        assert!(service.classify(&netflix_email()).await.is_err());
    }

    #[tokio::test]
    async fn non_retryable_transport_error_propagates() {
        let service = service(ScriptedTransport::new(vec![Err(SyncError::permanent(
            "HTTP 400: bad request",
        ))]));

        let err = service.classify(&netflix_email()).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(!err.is_job_fatal());
    }

    #[tokio::test]
    async fn body_is_truncated_to_budget() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::text(
            r#"{"is_subscription": false}"#,
        )]);
        let config = LlmConfig {
            max_body_chars: 100,
            ..LlmConfig::default()
        };
        let service = ClassificationService::new(
            Arc::new(transport),
            config.clone(),
            RetryPolicy::default(),
        );

        let mut email = netflix_email();
        email.body = "y".repeat(5000);
        let request = service.build_request(&email);
        let body_section = request.user.split("Body:\n").nth(1).unwrap();
        assert_eq!(body_section.chars().count(), 100);
    }
}
