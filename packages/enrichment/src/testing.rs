//! Mock fetcher and completion backends for tests.
//!
//! Both record every call so tests can assert on what the pipeline did
//! without touching the network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::completion::CompletionBackend;
use crate::error::{CompletionError, CompletionResult, FetchError, FetchResult};
use crate::fetcher::{normalize_target, PageFetcher};
use crate::types::result::RawPage;

/// A [`PageFetcher`] serving canned pages by target.
///
/// Targets with no configured page fail with a network error.
#[derive(Default)]
pub struct MockFetcher {
    pages: HashMap<String, String>,
    failures: HashMap<String, FetchError>,
    default_page: Option<String>,
    delay: Option<Duration>,
    calls: Arc<RwLock<Vec<String>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `html` for `target`.
    pub fn with_page(mut self, target: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(target.into(), html.into());
        self
    }

    /// Fail `target` with `error`.
    pub fn with_failure(mut self, target: impl Into<String>, error: FetchError) -> Self {
        self.failures.insert(target.into(), error);
        self
    }

    /// Serve `html` for any target not otherwise configured.
    pub fn with_default_page(mut self, html: impl Into<String>) -> Self {
        self.default_page = Some(html.into());
        self
    }

    /// Sleep this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Targets fetched so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, target: &str) -> FetchResult<RawPage> {
        self.calls.write().unwrap().push(target.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.failures.get(target) {
            return Err(err.clone());
        }

        let url = normalize_target(target)?.to_string();
        match self.pages.get(target).or(self.default_page.as_ref()) {
            Some(html) => Ok(RawPage::new(url, html.clone())),
            None => Err(FetchError::Network {
                url,
                message: "no page configured".into(),
            }),
        }
    }
}

/// A [`CompletionBackend`] with scripted responses.
///
/// Each call resolves in this order: a matching failure marker, the next
/// scripted result, then the default response.
pub struct MockCompletion {
    default_response: String,
    script: Arc<RwLock<VecDeque<CompletionResult<String>>>>,
    markers: Vec<(String, CompletionError)>,
    delay: Option<Duration>,
    prompts: Arc<RwLock<Vec<String>>>,
}

impl Default for MockCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCompletion {
    pub fn new() -> Self {
        Self {
            default_response: "mock analysis".to_string(),
            script: Arc::new(RwLock::new(VecDeque::new())),
            markers: Vec::new(),
            delay: None,
            prompts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    /// Queue a successful response.
    pub fn then_respond(self, response: impl Into<String>) -> Self {
        self.script.write().unwrap().push_back(Ok(response.into()));
        self
    }

    /// Queue a failure.
    pub fn then_fail(self, error: CompletionError) -> Self {
        self.script.write().unwrap().push_back(Err(error));
        self
    }

    /// Fail every prompt containing `marker`.
    pub fn fail_when_prompt_contains(
        mut self,
        marker: impl Into<String>,
        error: CompletionError,
    ) -> Self {
        self.markers.push((marker.into(), error));
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.prompts.read().unwrap().len()
    }
}

#[async_trait]
impl CompletionBackend for MockCompletion {
    async fn complete_once(&self, prompt: &str, _model: &str) -> CompletionResult<String> {
        self.prompts.write().unwrap().push(prompt.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some((_, err)) = self.markers.iter().find(|(m, _)| prompt.contains(m.as_str())) {
            return Err(err.clone());
        }

        let scripted = self.script.write().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.default_response.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_fetcher_tracks_calls() {
        let fetcher = MockFetcher::new()
            .with_page("a.com", "<p>A</p>")
            .with_failure(
                "b.com",
                FetchError::HttpStatus {
                    status: 500,
                    url: "https://b.com/".into(),
                },
            );

        assert_eq!(fetcher.fetch("a.com").await.unwrap().body, "<p>A</p>");
        assert!(matches!(
            fetcher.fetch("b.com").await,
            Err(FetchError::HttpStatus { status: 500, .. })
        ));
        assert!(matches!(
            fetcher.fetch("c.com").await,
            Err(FetchError::Network { .. })
        ));
        assert_eq!(fetcher.calls(), vec!["a.com", "b.com", "c.com"]);
    }

    #[tokio::test]
    async fn test_mock_completion_script_order() {
        let backend = MockCompletion::new()
            .with_default_response("default")
            .then_fail(CompletionError::Transient("503".into()))
            .then_respond("scripted");

        assert!(backend.complete_once("p", "m").await.is_err());
        assert_eq!(backend.complete_once("p", "m").await.unwrap(), "scripted");
        assert_eq!(backend.complete_once("p", "m").await.unwrap(), "default");
        assert_eq!(backend.call_count(), 3);
    }
}
