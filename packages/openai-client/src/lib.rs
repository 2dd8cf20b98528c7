//! Minimal OpenAI chat-completions REST client
//!
//! One call is one HTTP attempt. Failures come back as [`OpenAIError`] with
//! the HTTP status and any `Retry-After` hint attached, so retry policy can
//! live with the caller.
//!
//! # Example
//!
//! ```rust,ignore
//! use openai_client::{OpenAIClient, ChatRequest, Message};
//!
//! let client = OpenAIClient::new(api_key).with_timeout(Duration::from_secs(30));
//!
//! let response = client.chat_completion(
//!     ChatRequest::new("gpt-4o").message(Message::user("Hello!")),
//! ).await?;
//! ```

pub mod error;
pub mod types;

pub use error::{OpenAIError, Result};
pub use secrecy::SecretString;
pub use types::*;

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use tracing::{debug, warn};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// OpenAI API client.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct OpenAIClient {
    http_client: Client,
    api_key: SecretString,
    base_url: String,
    timeout: Duration,
}

impl std::fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl OpenAIClient {
    /// Create a new OpenAI client with the given API key.
    pub fn new(api_key: impl Into<SecretString>) -> Self {
        Self {
            http_client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create from environment variable `OPENAI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| OpenAIError::Config("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(SecretString::from(api_key)))
    }

    /// Set a custom base URL (for Azure, proxies, etc.).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Share an existing HTTP client (connection pool).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http_client = client;
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the per-request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Chat completion.
    ///
    /// Send messages to the chat completion API and get a response.
    pub async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse> {
        let start = std::time::Instant::now();

        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                AUTHORIZATION,
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, model = %request.model, "OpenAI request failed");
                map_transport_error(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            let err = api_error(status, &body, retry_after);
            warn!(status = %status, error = %err, "OpenAI API error");
            return Err(err);
        }

        let chat_response: types::ChatResponseRaw =
            response.json().await.map_err(|e| {
                if e.is_timeout() {
                    OpenAIError::Timeout(e.to_string())
                } else {
                    OpenAIError::Parse(e.to_string())
                }
            })?;

        let response = into_chat_response(chat_response)?;

        debug!(
            model = %request.model,
            duration_ms = start.elapsed().as_millis(),
            "OpenAI chat completion"
        );

        Ok(response)
    }
}

/// Take the first choice's text. A null or missing message is an
/// [`OpenAIError::EmptyResponse`], not a parse failure.
fn into_chat_response(raw: types::ChatResponseRaw) -> Result<ChatResponse> {
    let content = raw
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| OpenAIError::EmptyResponse("No content in OpenAI response".into()))?;

    Ok(ChatResponse {
        content,
        usage: raw.usage,
    })
}

fn map_transport_error(e: reqwest::Error) -> OpenAIError {
    if e.is_timeout() {
        OpenAIError::Timeout(e.to_string())
    } else if e.is_builder() {
        OpenAIError::Config(e.to_string())
    } else {
        OpenAIError::Network(e.to_string())
    }
}

/// Build an [`OpenAIError::Api`] from a non-2xx response.
///
/// Uses the `error.message` field of the JSON body when present.
fn api_error(status: StatusCode, body: &str, retry_after: Option<Duration>) -> OpenAIError {
    let message = serde_json::from_str::<types::ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| truncate_chars(body.trim(), 300).to_string());

    OpenAIError::Api {
        status: status.as_u16(),
        message,
        retry_after,
    }
}

/// Parse a `Retry-After` header given in whole or fractional seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && (0.0..=86_400.0).contains(secs))
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_client_builder() {
        let client = OpenAIClient::new(SecretString::from("sk-test".to_string()))
            .with_base_url("https://custom.api.com/")
            .with_timeout(Duration::from_secs(5));

        assert_eq!(client.base_url(), "https://custom.api.com");
        assert_eq!(client.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let client = OpenAIClient::new(SecretString::from("sk-secret-value".to_string()));
        let debug = format!("{:?}", client);
        assert!(!debug.contains("sk-secret-value"));
    }

    #[test]
    fn test_api_error_uses_json_message() {
        let body = r#"{"error":{"message":"Incorrect API key provided","type":"invalid_request_error"}}"#;
        let err = api_error(StatusCode::UNAUTHORIZED, body, None);
        match err {
            OpenAIError::Api { status, message, .. } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_api_error_falls_back_to_raw_body() {
        let err = api_error(StatusCode::BAD_GATEWAY, "  upstream down ", None);
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("upstream down"));
    }

    #[test]
    fn test_null_content_is_empty_response() {
        let raw: types::ChatResponseRaw = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null}}],"usage":null}"#,
        )
        .unwrap();
        assert!(matches!(
            into_chat_response(raw),
            Err(OpenAIError::EmptyResponse(_))
        ));

        let raw: types::ChatResponseRaw = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            into_chat_response(raw),
            Err(OpenAIError::EmptyResponse(_))
        ));

        let raw: types::ChatResponseRaw = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#,
        )
        .unwrap();
        assert_eq!(into_chat_response(raw).unwrap().content, "hi");
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(3)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0.5"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_millis(500)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        // Port 9 (discard) on localhost is closed on test hosts.
        let client = OpenAIClient::new(SecretString::from("sk-test".to_string()))
            .with_base_url("http://127.0.0.1:9")
            .with_timeout(Duration::from_secs(2));

        let err = tokio_test::assert_err!(
            client
                .chat_completion(ChatRequest::new("gpt-4o").message(Message::user("hi")))
                .await
        );

        assert!(
            matches!(err, OpenAIError::Network(_) | OpenAIError::Timeout(_)),
            "unexpected error: {:?}",
            err
        );
    }
}
