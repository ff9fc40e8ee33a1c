//! OpenAI-style chat-completions transport
//!
//! Production [`ChatTransport`] over a chat-completions endpoint with JSON
//! response format and low temperature. LLM-side auth failures map to
//! permanent (per-email) errors, never to the job-fatal credential kind
//! reserved for the mailbox connection.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::classify::{ChatOutcome, ChatRequest, ChatTransport};
use crate::config::LlmConfig;
use crate::error::SyncError;

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// Chat-completions client for an OpenAI-compatible API.
pub struct OpenAiChat {
    http_client: Client,
    api_base: String,
    api_key: String,
    model: String,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(std::time::Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_default(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
        }
    }
}

#[async_trait]
impl ChatTransport for OpenAiChat {
    async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, SyncError> {
        let payload = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: request.system,
                },
                Message {
                    role: "user".to_string(),
                    content: request.user,
                },
            ],
            temperature: 0.1,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| SyncError::transient(format!("chat request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(map_llm_error(status.as_u16(), retry_after, &body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| SyncError::transient(format!("failed to parse chat response: {e}")))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| SyncError::permanent("chat response contained no choices"))?;

        let (prompt_tokens, completion_tokens) = completion
            .usage
            .map(|usage| (usage.prompt_tokens, usage.completion_tokens))
            .unwrap_or((None, None));

        Ok(ChatOutcome {
            content,
            prompt_tokens,
            completion_tokens,
        })
    }
}

/// 429 and 5xx are retryable; every other status fails just this email.
fn map_llm_error(status: u16, retry_after: Option<u64>, body: &str) -> SyncError {
    match status {
        429 => SyncError::rate_limited(retry_after),
        s if s >= 500 => SyncError::transient(format!("HTTP {s}: {body}")),
        s => SyncError::permanent(format!("HTTP {s}: {body}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncErrorKind;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> LlmConfig {
        LlmConfig {
            api_base: server.uri(),
            api_key: Some("test-key".to_string()),
            ..LlmConfig::default()
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            system: "classify".to_string(),
            user: "Subject: hi".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_call_returns_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"is_subscription\": false}"}}],
                "usage": {"prompt_tokens": 210, "completion_tokens": 12}
            })))
            .mount(&server)
            .await;

        let transport = OpenAiChat::new(&config_for(&server));
        let outcome = transport.chat(request()).await.unwrap();

        assert_eq!(outcome.content, "{\"is_subscription\": false}");
        assert_eq!(outcome.prompt_tokens, Some(210));
        assert_eq!(outcome.completion_tokens, Some(12));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "17"))
            .mount(&server)
            .await;

        let transport = OpenAiChat::new(&config_for(&server));
        let err = transport.chat(request()).await.unwrap_err();

        assert_eq!(
            err.kind,
            SyncErrorKind::RateLimited {
                retry_after_secs: Some(17)
            }
        );
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let transport = OpenAiChat::new(&config_for(&server));
        let err = transport.chat(request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn llm_auth_failure_is_per_email_not_job_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let transport = OpenAiChat::new(&config_for(&server));
        let err = transport.chat(request()).await.unwrap_err();

        assert!(!err.is_retryable());
        assert!(!err.is_job_fatal());
    }

    #[tokio::test]
    async fn empty_choices_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let transport = OpenAiChat::new(&config_for(&server));
        let err = transport.chat(request()).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
