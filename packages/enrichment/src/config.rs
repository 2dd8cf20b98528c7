//! Pipeline configuration and tier profiles.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::error::ConfigError;
use crate::types::account::ServiceTier;

/// Parallelism and fetch pacing for one service tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierProfile {
    pub workers: usize,
    pub fetch_per_second: u32,
}

impl TierProfile {
    pub fn for_tier(tier: ServiceTier) -> Self {
        match tier {
            ServiceTier::Basic => Self {
                workers: 10,
                fetch_per_second: 5,
            },
            ServiceTier::Premium => Self {
                workers: 15,
                fetch_per_second: 10,
            },
            ServiceTier::Enterprise => Self {
                workers: 20,
                fetch_per_second: 20,
            },
        }
    }
}

/// Retry schedule for completion requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound on a server-supplied `Retry-After`
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(8),
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based), doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Delay before the next attempt, honouring a larger `Retry-After`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.backoff(attempt);
        match retry_after {
            Some(hint) => computed.max(hint.min(self.max_retry_after)),
            None => computed,
        }
    }
}

/// Tunables for the whole pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_timeout: Duration,
    pub max_body_bytes: usize,
    pub completion_timeout: Duration,
    /// Completion calls per second across a batch; 0 disables pacing
    pub completion_per_second: u32,
    pub max_prompt_chars: usize,
    pub max_content_chars: usize,
    pub retry: RetryPolicy,
    /// Hard cap on rows per batch
    pub max_batch_rows: usize,
    pub openai_base_url: String,
    /// Fixed worker count, overriding the tier profile
    pub workers_override: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(15),
            max_body_bytes: 2 * 1024 * 1024,
            completion_timeout: Duration::from_secs(30),
            completion_per_second: 10,
            max_prompt_chars: 6000,
            max_content_chars: 1500,
            retry: RetryPolicy::default(),
            max_batch_rows: 20_000,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            workers_override: None,
        }
    }
}

impl PipelineConfig {
    /// Load from `ENRICH_*` environment variables, reading `.env` first.
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64, _>(&lookup, "ENRICH_FETCH_TIMEOUT_SECS")? {
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var(&lookup, "ENRICH_MAX_BODY_BYTES")? {
            config.max_body_bytes = bytes;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "ENRICH_COMPLETION_TIMEOUT_SECS")? {
            config.completion_timeout = Duration::from_secs(secs);
        }
        if let Some(rate) = parse_var(&lookup, "ENRICH_COMPLETION_PER_SECOND")? {
            config.completion_per_second = rate;
        }
        if let Some(chars) = parse_var(&lookup, "ENRICH_MAX_PROMPT_CHARS")? {
            config.max_prompt_chars = chars;
        }
        if let Some(chars) = parse_var(&lookup, "ENRICH_MAX_CONTENT_CHARS")? {
            config.max_content_chars = chars;
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "ENRICH_MAX_ATTEMPTS")? {
            if attempts == 0 {
                return Err(ConfigError::Invalid {
                    key: "ENRICH_MAX_ATTEMPTS".into(),
                    value: attempts.to_string(),
                    reason: "must be at least 1".into(),
                });
            }
            config.retry.max_attempts = attempts;
        }
        if let Some(rows) = parse_var(&lookup, "ENRICH_MAX_BATCH_ROWS")? {
            config.max_batch_rows = rows;
        }
        if let Some(workers) = parse_var::<usize, _>(&lookup, "ENRICH_WORKERS")? {
            config.workers_override = Some(workers.max(1));
        }
        if let Some(url) = lookup("OPENAI_BASE_URL") {
            config.openai_base_url = url;
        }

        Ok(config)
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub fn with_completion_per_second(mut self, rate: u32) -> Self {
        self.completion_per_second = rate;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_batch_rows(mut self, rows: usize) -> Self {
        self.max_batch_rows = rows;
        self
    }

    pub fn with_openai_base_url(mut self, url: impl Into<String>) -> Self {
        self.openai_base_url = url.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers_override = Some(workers.max(1));
        self
    }

    /// Worker count and fetch pacing for a tier, after overrides.
    pub fn profile_for(&self, tier: ServiceTier) -> TierProfile {
        let mut profile = TierProfile::for_tier(tier);
        if let Some(workers) = self.workers_override {
            profile.workers = workers;
        }
        profile
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_tier_profiles() {
        assert_eq!(TierProfile::for_tier(ServiceTier::Basic).workers, 10);
        assert_eq!(TierProfile::for_tier(ServiceTier::Premium).workers, 15);
        assert_eq!(TierProfile::for_tier(ServiceTier::Enterprise).workers, 20);
        assert_eq!(
            TierProfile::for_tier(ServiceTier::Enterprise).fetch_per_second,
            20
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn test_retry_after_only_lengthens() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_millis(200))),
            Duration::from_secs(1)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(3600))),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ENRICH_FETCH_TIMEOUT_SECS", "5"),
            ("ENRICH_MAX_ATTEMPTS", "4"),
            ("ENRICH_WORKERS", "2"),
            ("OPENAI_BASE_URL", "http://localhost:9999/v1"),
        ]
        .into_iter()
        .collect();

        let config =
            PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.openai_base_url, "http://localhost:9999/v1");
        assert_eq!(config.profile_for(ServiceTier::Enterprise).workers, 2);
        assert_eq!(config.max_prompt_chars, 6000);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let result = PipelineConfig::from_lookup(|k| {
            (k == "ENRICH_MAX_BODY_BYTES").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid { key, .. }) if key == "ENRICH_MAX_BODY_BYTES"));

        let result =
            PipelineConfig::from_lookup(|k| (k == "ENRICH_MAX_ATTEMPTS").then(|| "0".to_string()));
        assert!(result.is_err());
    }
}
