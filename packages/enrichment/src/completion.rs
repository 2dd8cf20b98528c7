//! Text generation with bounded retry.
//!
//! [`CompletionBackend`] makes one request. [`CompletionClient`] wraps a
//! backend with prompt truncation, pacing, and the retry state machine.

use std::sync::Arc;

use async_trait::async_trait;
use openai_client::{truncate_chars, ChatRequest, Message, OpenAIClient, OpenAIError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{PipelineConfig, RetryPolicy};
use crate::error::{CompletionError, CompletionResult};
use crate::prompts::SYSTEM_PROMPT;
use crate::rate_limit::RateLimiter;

/// Response length cap sent with every request.
pub const MAX_RESPONSE_TOKENS: u32 = 500;

/// Sampling temperature sent with every request.
pub const TEMPERATURE: f32 = 0.7;

/// One completion request against a text-generation service.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete_once(&self, prompt: &str, model: &str) -> CompletionResult<String>;
}

#[async_trait]
impl CompletionBackend for OpenAIClient {
    async fn complete_once(&self, prompt: &str, model: &str) -> CompletionResult<String> {
        let request = ChatRequest::new(model)
            .message(Message::system(SYSTEM_PROMPT))
            .message(Message::user(prompt))
            .temperature(TEMPERATURE)
            .token_limit(MAX_RESPONSE_TOKENS);

        self.chat_completion(request)
            .await
            .map(|response| response.content)
            .map_err(classify)
    }
}

/// Map a client error onto the retry classes.
pub fn classify(err: OpenAIError) -> CompletionError {
    match err {
        // A refusal comes back the same way on every attempt
        OpenAIError::Config(msg) | OpenAIError::EmptyResponse(msg) => CompletionError::Fatal(msg),
        OpenAIError::Network(msg) | OpenAIError::Timeout(msg) | OpenAIError::Parse(msg) => {
            CompletionError::Transient(msg)
        }
        OpenAIError::Api {
            status,
            message,
            retry_after,
        } => match status {
            // An exhausted billing quota also comes back as 429
            429 if message.to_ascii_lowercase().contains("quota") => {
                CompletionError::Fatal(message)
            }
            429 => CompletionError::RateLimited {
                message,
                retry_after,
            },
            408 | 409 | 500..=599 => CompletionError::Transient(format!("HTTP {}: {}", status, message)),
            _ => CompletionError::Fatal(format!("HTTP {}: {}", status, message)),
        },
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
enum Attempt {
    Success(String),
    RetryableFailure(CompletionError),
    FatalFailure(CompletionError),
}

impl From<CompletionResult<String>> for Attempt {
    fn from(result: CompletionResult<String>) -> Self {
        match result {
            Ok(text) => Self::Success(text),
            Err(e) if e.is_retryable() => Self::RetryableFailure(e),
            Err(e) => Self::FatalFailure(e),
        }
    }
}

/// Completion client shared by all workers of a batch.
#[derive(Clone)]
pub struct CompletionClient {
    backend: Arc<dyn CompletionBackend>,
    retry: RetryPolicy,
    max_prompt_chars: usize,
    limiter: Option<Arc<RateLimiter>>,
}

impl CompletionClient {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        let defaults = PipelineConfig::default();
        Self {
            backend,
            retry: defaults.retry,
            max_prompt_chars: defaults.max_prompt_chars,
            limiter: None,
        }
    }

    pub fn from_config(backend: Arc<dyn CompletionBackend>, config: &PipelineConfig) -> Self {
        Self {
            backend,
            retry: config.retry,
            max_prompt_chars: config.max_prompt_chars,
            limiter: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_prompt_chars(mut self, max_chars: usize) -> Self {
        self.max_prompt_chars = max_chars;
        self
    }

    /// Pace every attempt through `limiter`.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Run one completion, retrying rate-limit and transient failures.
    ///
    /// The prompt is truncated to the configured character limit first.
    /// The returned text is trimmed. Once `cancel` fires, waiting for a
    /// permit, an in-flight request, or a backoff sleep ends with
    /// [`CompletionError::Cancelled`].
    pub async fn complete(
        &self,
        prompt: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> CompletionResult<String> {
        let prompt = truncate_chars(prompt.trim(), self.max_prompt_chars);
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if let Some(limiter) = &self.limiter {
                if !limiter.acquire_until(cancel).await {
                    return Err(CompletionError::Cancelled);
                }
            }

            let result = tokio::select! {
                biased;
                result = self.backend.complete_once(prompt, model) => result,
                _ = cancel.cancelled() => Err(CompletionError::Cancelled),
            };

            match Attempt::from(result) {
                Attempt::Success(text) => {
                    debug!(attempt, model, "Completion succeeded");
                    return Ok(text.trim().to_string());
                }
                Attempt::FatalFailure(CompletionError::Cancelled) => {
                    debug!(attempt, model, "Completion cancelled");
                    return Err(CompletionError::Cancelled);
                }
                Attempt::FatalFailure(e) => {
                    warn!(attempt, model, error = %e, "Completion failed, not retrying");
                    return Err(e);
                }
                Attempt::RetryableFailure(e) => {
                    if attempt >= max_attempts {
                        warn!(attempt, model, error = %e, "Completion retries exhausted");
                        return Err(e);
                    }

                    let delay = self.retry.delay_for(attempt, e.retry_after());
                    warn!(
                        attempt,
                        model,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Completion failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(attempt, model, "Completion cancelled during backoff");
                            return Err(CompletionError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::testing::MockCompletion;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            max_retry_after: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_classify() {
        let rate = classify(OpenAIError::Api {
            status: 429,
            message: "Rate limit reached".into(),
            retry_after: Some(Duration::from_secs(1)),
        });
        assert!(matches!(rate, CompletionError::RateLimited { retry_after: Some(_), .. }));

        let quota = classify(OpenAIError::Api {
            status: 429,
            message: "You exceeded your current quota".into(),
            retry_after: None,
        });
        assert!(matches!(quota, CompletionError::Fatal(_)));

        for status in [408, 500, 502, 503] {
            let err = classify(OpenAIError::Api {
                status,
                message: "x".into(),
                retry_after: None,
            });
            assert!(matches!(err, CompletionError::Transient(_)), "{}", status);
        }

        for status in [400, 401, 403, 404] {
            let err = classify(OpenAIError::Api {
                status,
                message: "x".into(),
                retry_after: None,
            });
            assert!(matches!(err, CompletionError::Fatal(_)), "{}", status);
        }

        assert!(matches!(
            classify(OpenAIError::Timeout("slow".into())),
            CompletionError::Transient(_)
        ));
        assert!(matches!(
            classify(OpenAIError::Config("no key".into())),
            CompletionError::Fatal(_)
        ));
        assert!(matches!(
            classify(OpenAIError::Parse("expected value at line 1".into())),
            CompletionError::Transient(_)
        ));
        assert!(matches!(
            classify(OpenAIError::EmptyResponse("No content in OpenAI response".into())),
            CompletionError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_success_is_trimmed() {
        let backend = Arc::new(MockCompletion::new().with_default_response("  answer \n"));
        let client = CompletionClient::new(backend.clone()).with_retry(fast_retry());

        assert_eq!(client.complete("prompt", "gpt", &CancellationToken::new()).await.unwrap(), "answer");
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let backend = Arc::new(
            MockCompletion::new()
                .then_fail(CompletionError::Transient("503".into()))
                .then_fail(CompletionError::RateLimited {
                    message: "slow".into(),
                    retry_after: None,
                })
                .then_respond("third time"),
        );
        let client = CompletionClient::new(backend.clone()).with_retry(fast_retry());

        assert_eq!(client.complete("prompt", "gpt", &CancellationToken::new()).await.unwrap(), "third time");
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let backend = Arc::new(
            MockCompletion::new()
                .then_fail(CompletionError::Transient("a".into()))
                .then_fail(CompletionError::Transient("b".into()))
                .then_fail(CompletionError::Transient("c".into()))
                .then_respond("never reached"),
        );
        let client = CompletionClient::new(backend.clone()).with_retry(fast_retry());

        let err = client.complete("prompt", "gpt", &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, CompletionError::Transient("c".into()));
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fatal_returns_immediately() {
        let backend = Arc::new(
            MockCompletion::new()
                .then_fail(CompletionError::Fatal("invalid api key".into()))
                .then_respond("never reached"),
        );
        let client = CompletionClient::new(backend.clone()).with_retry(fast_retry());

        let err = client.complete("prompt", "gpt", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, CompletionError::Fatal(_)));
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_after_hint_lengthens_wait() {
        let backend = Arc::new(
            MockCompletion::new()
                .then_fail(CompletionError::RateLimited {
                    message: "slow".into(),
                    retry_after: Some(Duration::from_millis(40)),
                })
                .then_respond("ok"),
        );
        let client = CompletionClient::new(backend.clone()).with_retry(fast_retry());

        let start = Instant::now();
        client.complete("prompt", "gpt", &CancellationToken::new()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_prompt_truncated() {
        let backend = Arc::new(MockCompletion::new());
        let client = CompletionClient::new(backend.clone())
            .with_retry(fast_retry())
            .with_max_prompt_chars(10);

        client.complete(&"x".repeat(50), "gpt", &CancellationToken::new()).await.unwrap();
        assert_eq!(backend.prompts(), vec!["x".repeat(10)]);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_after_wait() {
        let backend = Arc::new(MockCompletion::new().then_fail(CompletionError::RateLimited {
            message: "slow".into(),
            retry_after: Some(Duration::from_secs(20)),
        }));
        let client = CompletionClient::new(backend.clone());

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });
        }

        let start = Instant::now();
        let err = client.complete("prompt", "gpt", &cancel).await.unwrap_err();

        assert_eq!(err, CompletionError::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_request_and_permit_wait() {
        let backend = Arc::new(MockCompletion::new().with_delay(Duration::from_secs(20)));
        let client = CompletionClient::new(backend.clone());
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            });
        }

        let start = Instant::now();
        assert_eq!(
            client.complete("prompt", "gpt", &cancel).await,
            Err(CompletionError::Cancelled)
        );
        assert!(start.elapsed() < Duration::from_secs(2));

        // Already cancelled: a drained limiter is not waited on
        let limiter = Arc::new(RateLimiter::per_second(1));
        limiter.acquire().await;
        let client = CompletionClient::new(Arc::new(MockCompletion::new())).with_limiter(limiter);
        let start = Instant::now();
        assert_eq!(
            client.complete("prompt", "gpt", &cancel).await,
            Err(CompletionError::Cancelled)
        );
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
