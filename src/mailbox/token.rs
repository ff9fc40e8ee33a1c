//! Access token collaborator
//!
//! The pipeline never handles OAuth flows itself; it asks a [`TokenProvider`]
//! for a usable access token and treats any failure as a credential error,
//! which is fatal to the running job.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::error::SyncError;
use crate::models::connection;

/// Google OAuth token endpoint.
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Refresh when the stored token expires within this window.
const REFRESH_LEAD_MINUTES: i64 = 5;

/// Supplies a decrypted access token for a connection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, connection: &connection::Model) -> Result<String, SyncError>;
}

/// Google OAuth token response
#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

/// Token provider backed by the Google OAuth refresh grant.
///
/// The stored ciphertexts are opaque to the pipeline; this collaborator owns
/// their interpretation.
pub struct GoogleTokenProvider {
    client_id: String,
    client_secret: String,
    http_client: Client,
    token_endpoint: String,
}

impl GoogleTokenProvider {
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self::with_endpoint(client_id, client_secret, GOOGLE_TOKEN_URL.to_string())
    }

    /// Endpoint override used by tests.
    pub fn with_endpoint(client_id: String, client_secret: String, token_endpoint: String) -> Self {
        Self {
            client_id,
            client_secret,
            http_client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            token_endpoint,
        }
    }

    fn decode_token(bytes: &[u8], which: &str) -> Result<String, SyncError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SyncError::unauthorized(format!("invalid {which} token encoding: {e}")))
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<String, SyncError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .http_client
            .post(&self.token_endpoint)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| SyncError::unauthorized(format!("token refresh request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // Any refusal here means the stored grant is unusable.
            return Err(SyncError::unauthorized(format!(
                "token refresh failed with status {status}: {body}"
            )));
        }

        let token: GoogleTokenResponse = response.json().await.map_err(|e| {
            SyncError::unauthorized(format!("failed to parse token response: {e}"))
        })?;

        Ok(token.access_token)
    }
}

#[async_trait]
impl TokenProvider for GoogleTokenProvider {
    async fn access_token(&self, connection: &connection::Model) -> Result<String, SyncError> {
        let expires_soon = connection
            .token_expires_at
            .map(|expiry| expiry <= Utc::now() + Duration::minutes(REFRESH_LEAD_MINUTES))
            .unwrap_or(true);

        if !expires_soon
            && let Some(access) = connection.access_token_ciphertext.as_ref()
        {
            return Self::decode_token(access, "access");
        }

        let refresh_bytes = connection
            .refresh_token_ciphertext
            .as_ref()
            .ok_or_else(|| SyncError::unauthorized("no refresh token available"))?;
        let refresh_token = Self::decode_token(refresh_bytes, "refresh")?;

        tracing::debug!(connection_id = %connection.id, "Refreshing expired access token");
        self.refresh_access_token(&refresh_token).await
    }
}

/// Provider returning a fixed token; used by tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new<S: Into<String>>(token: S) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self, _connection: &connection::Model) -> Result<String, SyncError> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn build_connection(
        expires_at: Option<chrono::DateTime<Utc>>,
        refresh: Option<&str>,
    ) -> connection::Model {
        connection::Model {
            id: Uuid::new_v4(),
            email_address: "user@example.com".to_string(),
            access_token_ciphertext: Some(b"stored-access-token".to_vec()),
            refresh_token_ciphertext: refresh.map(|t| t.as_bytes().to_vec()),
            token_expires_at: expires_at.map(Into::into),
            history_id: None,
            last_synced_at: None,
            is_active: true,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn returns_stored_token_when_fresh() {
        let provider = GoogleTokenProvider::new("id".to_string(), "secret".to_string());
        let connection = build_connection(Some(Utc::now() + Duration::hours(1)), None);

        let token = provider.access_token(&connection).await.unwrap();
        assert_eq!(token, "stored-access-token");
    }

    #[tokio::test]
    async fn refreshes_when_token_expires_soon() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let provider = GoogleTokenProvider::with_endpoint(
            "id".to_string(),
            "secret".to_string(),
            format!("{}/token", server.uri()),
        );
        let connection =
            build_connection(Some(Utc::now() + Duration::minutes(2)), Some("refresh-me"));

        let token = provider.access_token(&connection).await.unwrap();
        assert_eq!(token, "fresh-token");
    }

    #[tokio::test]
    async fn refresh_refusal_is_a_credential_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#),
            )
            .mount(&server)
            .await;

        let provider = GoogleTokenProvider::with_endpoint(
            "id".to_string(),
            "secret".to_string(),
            format!("{}/token", server.uri()),
        );
        let connection = build_connection(None, Some("revoked"));

        let err = provider.access_token(&connection).await.unwrap_err();
        assert!(err.is_job_fatal());
    }

    #[tokio::test]
    async fn missing_refresh_token_is_a_credential_failure() {
        let provider = GoogleTokenProvider::new("id".to_string(), "secret".to_string());
        let connection = build_connection(None, None);

        let err = provider.access_token(&connection).await.unwrap_err();
        assert!(err.is_job_fatal());
    }
}
