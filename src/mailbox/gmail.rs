//! Gmail message source
//!
//! Implements [`MessageSource`] against the Gmail REST API with incremental
//! listing via the History API, a transparent date-query fallback when the
//! history cursor has expired, and rate-limit aware retries.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;

use crate::backoff::RetryPolicy;
use crate::error::SyncError;
use crate::mailbox::token::TokenProvider;
use crate::mailbox::{EmailContent, MessageListing, MessageSource, SyncWindow};
use crate::models::connection;

/// Gmail API base endpoint
const GMAIL_USERS_ENDPOINT: &str = "https://gmail.googleapis.com/gmail/v1/users";

/// Page size requested from the provider per listing call.
const LIST_PAGE_SIZE: usize = 100;

/// Gmail message list response
#[derive(Debug, Deserialize)]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Reference to a message in a listing
#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// Gmail history response
#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(rename = "historyId")]
    history_id: String,
    history: Option<Vec<HistoryRecord>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Gmail history record
#[derive(Debug, Deserialize)]
struct HistoryRecord {
    #[serde(rename = "messagesAdded")]
    messages_added: Option<Vec<HistoryMessage>>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    message: MessageRef,
}

/// Gmail profile response (carries the current history cursor)
#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(rename = "historyId")]
    history_id: Option<String>,
}

/// Full Gmail message
#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<MessagePart>,
}

/// Message payload part; parts nest for multipart messages
#[derive(Debug, Deserialize)]
struct MessagePart {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<MessageHeader>>,
    body: Option<PartBody>,
    parts: Option<Vec<MessagePart>>,
}

#[derive(Debug, Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PartBody {
    data: Option<String>,
}

/// Gmail implementation of [`MessageSource`], bound to one connection.
pub struct GmailSource {
    http_client: Client,
    token_provider: Arc<dyn TokenProvider>,
    connection: connection::Model,
    /// Gmail API base endpoint (overridable for tests)
    users_endpoint: String,
    retry: RetryPolicy,
}

impl GmailSource {
    pub fn new(
        token_provider: Arc<dyn TokenProvider>,
        connection: connection::Model,
        retry: RetryPolicy,
    ) -> Self {
        Self::with_users_endpoint(
            token_provider,
            connection,
            retry,
            GMAIL_USERS_ENDPOINT.to_string(),
        )
    }

    /// Endpoint override used by tests.
    pub fn with_users_endpoint(
        token_provider: Arc<dyn TokenProvider>,
        connection: connection::Model,
        retry: RetryPolicy,
        users_endpoint: String,
    ) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token_provider,
            connection,
            users_endpoint,
            retry,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        access_token: &str,
    ) -> Result<T, SyncError> {
        let response = self
            .http_client
            .get(url)
            .header("Authorization", format!("Bearer {access_token}"))
            .send()
            .await
            .map_err(SyncError::from)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(map_gmail_error(status.as_u16(), retry_after, &body));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SyncError::transient(format!("failed to parse Gmail response: {e}")))
    }

    /// List changed message ids from the history cursor.
    ///
    /// Returns `Ok(None)` when the provider rejects the cursor as stale, which
    /// triggers the date-based fallback in the caller.
    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: &str,
        max_messages: usize,
    ) -> Result<Option<MessageListing>, SyncError> {
        let mut ids = Vec::new();
        let mut latest_history_id = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/me/history?startHistoryId={}&historyTypes=messageAdded&maxResults={}",
                self.users_endpoint, start_history_id, LIST_PAGE_SIZE
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }

            let response = match self
                .retry
                .retry("gmail.history", || self.get_json::<HistoryResponse>(&url, access_token))
                .await
            {
                Ok(response) => response,
                Err(err) if is_stale_cursor(&err) => {
                    tracing::warn!(
                        connection_id = %self.connection.id,
                        start_history_id,
                        "History cursor rejected as stale, falling back to date query"
                    );
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };

            latest_history_id = Some(response.history_id.clone());

            for record in response.history.unwrap_or_default() {
                for added in record.messages_added.unwrap_or_default() {
                    if ids.len() >= max_messages {
                        break;
                    }
                    ids.push(added.message.id);
                }
            }

            page_token = response.next_page_token;
            if page_token.is_none() || ids.len() >= max_messages {
                break;
            }
        }

        Ok(Some(MessageListing {
            ids,
            latest_history_id,
        }))
    }

    /// List message ids received after the given instant.
    async fn list_by_date(
        &self,
        access_token: &str,
        after: DateTime<Utc>,
        max_messages: usize,
    ) -> Result<Vec<String>, SyncError> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page_size = LIST_PAGE_SIZE.min(max_messages - ids.len());
            let mut url = format!(
                "{}/me/messages?q=after:{}&maxResults={}",
                self.users_endpoint,
                after.timestamp(),
                page_size
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }

            let response = self
                .retry
                .retry("gmail.list", || {
                    self.get_json::<MessageListResponse>(&url, access_token)
                })
                .await?;

            for message in response.messages.unwrap_or_default() {
                if ids.len() >= max_messages {
                    break;
                }
                ids.push(message.id);
            }

            page_token = response.next_page_token;
            if page_token.is_none() || ids.len() >= max_messages {
                break;
            }
        }

        Ok(ids)
    }

    /// Current mailbox history id, recorded so the next sync can use the
    /// cheaper history query.
    async fn current_history_id(&self, access_token: &str) -> Result<Option<String>, SyncError> {
        let url = format!("{}/me/profile", self.users_endpoint);
        let profile = self
            .retry
            .retry("gmail.profile", || {
                self.get_json::<ProfileResponse>(&url, access_token)
            })
            .await?;
        Ok(profile.history_id)
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    async fn list_since(&self, window: &SyncWindow) -> Result<MessageListing, SyncError> {
        let access_token = self.token_provider.access_token(&self.connection).await?;

        if let Some(history_id) = &window.history_id
            && let Some(listing) = self
                .list_history(&access_token, history_id, window.max_messages)
                .await?
        {
            return Ok(listing);
        }

        let ids = self
            .list_by_date(&access_token, window.after, window.max_messages)
            .await?;
        let latest_history_id = self.current_history_id(&access_token).await?;

        Ok(MessageListing {
            ids,
            latest_history_id,
        })
    }

    async fn fetch(&self, message_id: &str) -> Result<EmailContent, SyncError> {
        let access_token = self.token_provider.access_token(&self.connection).await?;
        let url = format!(
            "{}/me/messages/{}?format=full",
            self.users_endpoint, message_id
        );

        let message = self
            .retry
            .retry("gmail.get", || {
                self.get_json::<GmailMessage>(&url, &access_token)
            })
            .await?;

        let payload = message.payload.as_ref();
        let subject = header_value(payload, "Subject").unwrap_or_default();
        let sender = header_value(payload, "From").unwrap_or_default();
        let body = payload.map(extract_body).unwrap_or_default();
        let received_at = message
            .internal_date
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);

        Ok(EmailContent {
            id: message.id,
            subject,
            sender,
            body,
            received_at,
        })
    }
}

/// Map a Gmail error status to the shared taxonomy.
///
/// 403 responses carrying quota markers are treated as rate limits rather
/// than credential failures.
fn map_gmail_error(status: u16, retry_after: Option<u64>, body: &str) -> SyncError {
    if status == 429 {
        return SyncError::rate_limited(retry_after.or(Some(60)));
    }

    if status == 403 {
        let body_lower = body.to_lowercase();
        let quota_error_patterns = [
            "userratelimitexceeded",
            "ratelimitexceeded",
            "quotaexceeded",
            "servicelimit",
            "daily limit",
            "billing limit",
        ];
        if quota_error_patterns
            .iter()
            .any(|pattern| body_lower.contains(pattern))
        {
            return SyncError::rate_limited(retry_after.or(Some(60)));
        }
        return SyncError::unauthorized(format!("access forbidden: {body}"));
    }

    SyncError::from_http_status(status, body)
}

/// Whether the error marks the history cursor as unusable.
fn is_stale_cursor(err: &SyncError) -> bool {
    err.message
        .as_deref()
        .map(|msg| msg.contains("HTTP 404"))
        .unwrap_or(false)
}

fn header_value(payload: Option<&MessagePart>, name: &str) -> Option<String> {
    payload?
        .headers
        .as_ref()?
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

/// Extract a plain-text body, preferring `text/plain` parts and falling back
/// to HTML with tags stripped.
fn extract_body(payload: &MessagePart) -> String {
    if let Some(part) = find_part(payload, "text/plain")
        && let Some(text) = decode_part(part)
    {
        return text;
    }

    if let Some(part) = find_part(payload, "text/html")
        && let Some(html) = decode_part(part)
    {
        return strip_html(&html);
    }

    String::new()
}

fn find_part<'a>(part: &'a MessagePart, mime_type: &str) -> Option<&'a MessagePart> {
    if part.mime_type.as_deref() == Some(mime_type)
        && part.body.as_ref().is_some_and(|b| b.data.is_some())
    {
        return Some(part);
    }

    part.parts
        .as_ref()?
        .iter()
        .find_map(|child| find_part(child, mime_type))
}

fn decode_part(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_deref()?;
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(data)
        .or_else(|_| general_purpose::URL_SAFE.decode(data))
        .ok()?;
    String::from_utf8(bytes).ok()
}

fn strip_html(html: &str) -> String {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    static WS_RE: OnceLock<Regex> = OnceLock::new();

    let without_tags = TAG_RE
        .get_or_init(|| Regex::new(r"(?s)<(script|style)[^>]*>.*?</(script|style)>|<[^>]*>").unwrap())
        .replace_all(html, " ");
    let collapsed = WS_RE
        .get_or_init(|| Regex::new(r"\s+").unwrap())
        .replace_all(&without_tags, " ");
    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::token::StaticTokenProvider;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn build_test_connection() -> connection::Model {
        connection::Model {
            id: Uuid::new_v4(),
            email_address: "test@example.com".to_string(),
            access_token_ciphertext: Some(b"test-access-token".to_vec()),
            refresh_token_ciphertext: None,
            token_expires_at: None,
            history_id: None,
            last_synced_at: None,
            is_active: true,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_seconds: 0,
            max_seconds: 0,
            jitter_factor: 0.0,
        }
    }

    fn build_source(server: &MockServer) -> GmailSource {
        GmailSource::with_users_endpoint(
            Arc::new(StaticTokenProvider::new("test-access-token")),
            build_test_connection(),
            fast_retry(),
            format!("{}/gmail/v1/users", server.uri()),
        )
    }

    #[tokio::test]
    async fn history_listing_collects_added_messages_and_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .and(query_param("startHistoryId", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "historyId": "99",
                "history": [
                    {"messagesAdded": [{"message": {"id": "m1"}}, {"message": {"id": "m2"}}]},
                    {"messagesAdded": [{"message": {"id": "m3"}}]}
                ]
            })))
            .mount(&server)
            .await;

        let source = build_source(&server);
        let window = SyncWindow {
            history_id: Some("42".to_string()),
            after: Utc::now(),
            max_messages: 100,
        };

        let listing = source.list_since(&window).await.unwrap();
        assert_eq!(listing.ids, vec!["m1", "m2", "m3"]);
        assert_eq!(listing.latest_history_id.as_deref(), Some("99"));
    }

    #[tokio::test]
    async fn stale_history_cursor_falls_back_to_date_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/history"))
            .respond_with(ResponseTemplate::new(404).set_body_string("history not found"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"id": "d1"}, {"id": "d2"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/profile"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"historyId": "7001"})),
            )
            .mount(&server)
            .await;

        let source = build_source(&server);
        let window = SyncWindow {
            history_id: Some("stale".to_string()),
            after: Utc::now(),
            max_messages: 100,
        };

        let listing = source.list_since(&window).await.unwrap();
        assert_eq!(listing.ids, vec!["d1", "d2"]);
        assert_eq!(listing.latest_history_id.as_deref(), Some("7001"));
    }

    #[tokio::test]
    async fn date_listing_respects_message_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": (0..100).map(|i| json!({"id": format!("m{i}")})).collect::<Vec<_>>(),
                "nextPageToken": "next"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/profile"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"historyId": "1"})))
            .mount(&server)
            .await;

        let source = build_source(&server);
        let window = SyncWindow {
            history_id: None,
            after: Utc::now(),
            max_messages: 100,
        };

        let listing = source.list_since(&window).await.unwrap();
        assert_eq!(listing.ids.len(), 100);
    }

    #[tokio::test]
    async fn fetch_prefers_plain_text_part() {
        let server = MockServer::start().await;
        let plain = general_purpose::URL_SAFE_NO_PAD.encode("plain body text");
        let html = general_purpose::URL_SAFE_NO_PAD.encode("<p>html body</p>");
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m1",
                "internalDate": "1700000000000",
                "payload": {
                    "mimeType": "multipart/alternative",
                    "headers": [
                        {"name": "Subject", "value": "Your receipt"},
                        {"name": "From", "value": "billing@vendor.com"}
                    ],
                    "parts": [
                        {"mimeType": "text/html", "body": {"data": html}},
                        {"mimeType": "text/plain", "body": {"data": plain}}
                    ]
                }
            })))
            .mount(&server)
            .await;

        let source = build_source(&server);
        let email = source.fetch("m1").await.unwrap();

        assert_eq!(email.subject, "Your receipt");
        assert_eq!(email.sender, "billing@vendor.com");
        assert_eq!(email.body, "plain body text");
        assert!(email.received_at.is_some());
    }

    #[tokio::test]
    async fn fetch_strips_html_when_no_plain_part() {
        let server = MockServer::start().await;
        let html =
            general_purpose::URL_SAFE_NO_PAD.encode("<div><b>Total:</b> $9.99<br/></div>");
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m2",
                "payload": {
                    "mimeType": "text/html",
                    "headers": [{"name": "Subject", "value": "Invoice"}],
                    "body": {"data": html}
                }
            })))
            .mount(&server)
            .await;

        let source = build_source(&server);
        let email = source.fetch("m2").await.unwrap();
        assert_eq!(email.body, "Total: $9.99");
    }

    #[tokio::test]
    async fn rate_limited_fetch_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m3"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "m3",
                "payload": {
                    "mimeType": "text/plain",
                    "headers": [{"name": "Subject", "value": "ok"}],
                    "body": {"data": general_purpose::URL_SAFE_NO_PAD.encode("done")}
                }
            })))
            .mount(&server)
            .await;

        let source = build_source(&server);
        let email = source.fetch("m3").await.unwrap();
        assert_eq!(email.body, "done");
    }

    #[tokio::test]
    async fn auth_failure_propagates_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gmail/v1/users/me/messages/m4"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
            .expect(1)
            .mount(&server)
            .await;

        let source = build_source(&server);
        let err = source.fetch("m4").await.unwrap_err();
        assert!(err.is_job_fatal());
    }

    #[test]
    fn quota_403_maps_to_rate_limit() {
        let err = map_gmail_error(403, None, r#"{"error":{"status":"userRateLimitExceeded"}}"#);
        assert!(err.is_retryable());

        let err = map_gmail_error(403, None, "access denied");
        assert!(err.is_job_fatal());
    }
}
