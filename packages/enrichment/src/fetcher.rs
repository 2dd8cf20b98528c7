//! Single-attempt page fetching.

use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use tracing::{debug, warn};
use url::Url;

use crate::config::PipelineConfig;
use crate::error::{ConfigError, FetchError, FetchResult};
use crate::types::result::RawPage;

/// Browser User-Agents rotated per request.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

const MAX_REDIRECTS: usize = 10;

/// Fetches one target page.
///
/// Implementations make exactly one attempt. Retrying is the caller's call.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, target: &str) -> FetchResult<RawPage>;
}

/// Turn a target cell into a fetchable URL.
///
/// Targets without a scheme get `https://`. Only `http` and `https` are
/// accepted.
pub fn normalize_target(target: &str) -> FetchResult<Url> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(FetchError::invalid(target, "empty target"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&candidate).map_err(|e| FetchError::invalid(target, e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(FetchError::invalid(
                target,
                format!("unsupported scheme {}", other),
            ))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(FetchError::invalid(target, "missing host"));
    }

    Ok(url)
}

fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// reqwest-backed [`PageFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_body_bytes: usize) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;

        Ok(Self {
            client,
            max_body_bytes,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Self::new(config.fetch_timeout, config.max_body_bytes)
    }

    /// Read at most `max_body_bytes` of the body.
    async fn read_capped(
        &self,
        url: &str,
        mut response: reqwest::Response,
    ) -> FetchResult<String> {
        let mut body: Vec<u8> = Vec::new();

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_reqwest_error(url, e))?
        {
            let room = self.max_body_bytes.saturating_sub(body.len());
            if chunk.len() >= room {
                body.extend_from_slice(&chunk[..room]);
                debug!(url = %url, cap = self.max_body_bytes, "Body truncated at cap");
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

fn map_reqwest_error(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, target: &str) -> FetchResult<RawPage> {
        let url = normalize_target(target)?;
        let url_str = url.to_string();
        let user_agent = random_user_agent();

        debug!(url = %url_str, "HTTP fetch starting");

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, user_agent)
            .header(ACCEPT, BROWSER_ACCEPT)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await
            .map_err(|e| {
                warn!(url = %url_str, error = %e, "HTTP request failed");
                map_reqwest_error(&url_str, e)
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url_str, status = status.as_u16(), "Non-success status");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url_str,
            });
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = self.read_capped(&url_str, response).await?;

        debug!(
            url = %url_str,
            final_url = %final_url,
            bytes = body.len(),
            "Page fetched"
        );

        Ok(RawPage {
            url: url_str,
            final_url,
            status: status.as_u16(),
            body,
            content_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_https() {
        let url = normalize_target("  example.com ").unwrap();
        assert_eq!(url.as_str(), "https://example.com/");

        let url = normalize_target("http://example.com/about").unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.path(), "/about");
    }

    #[test]
    fn test_normalize_rejects_bad_targets() {
        assert!(matches!(
            normalize_target("   "),
            Err(FetchError::InvalidTarget { .. })
        ));
        assert!(matches!(
            normalize_target("ftp://example.com"),
            Err(FetchError::InvalidTarget { .. })
        ));
        assert!(matches!(
            normalize_target("https://"),
            Err(FetchError::InvalidTarget { .. })
        ));
        assert!(matches!(
            normalize_target("not a url at all"),
            Err(FetchError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_user_agent_is_browser_like() {
        for _ in 0..20 {
            assert!(random_user_agent().starts_with("Mozilla/5.0"));
        }
    }

    #[tokio::test]
    async fn test_invalid_target_fails_without_network() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1), 1024).unwrap();
        let result = fetcher.fetch("").await;
        assert!(matches!(result, Err(FetchError::InvalidTarget { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let fetcher = HttpFetcher::new(Duration::from_secs(2), 1024).unwrap();
        // Port 1 on loopback is closed in any sane environment
        let result = fetcher.fetch("http://127.0.0.1:1/").await;
        assert!(matches!(
            result,
            Err(FetchError::Network { .. }) | Err(FetchError::Timeout { .. })
        ));
    }
}
