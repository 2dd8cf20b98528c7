//! Batch entry point: reserve, schedule, commit, assemble.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::assembler::ResultAssembler;
use crate::completion::{CompletionBackend, CompletionClient};
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, QuotaError, Result};
use crate::extractor::ContentExtractor;
use crate::fetcher::{HttpFetcher, PageFetcher};
use crate::processor::{ProcessorDeps, RowProcessor};
use crate::progress::ProgressSink;
use crate::quota::{QuotaLedger, Reservation};
use crate::rate_limit::RateLimiter;
use crate::scheduler::{BatchScheduler, BatchSnapshot};
use crate::table::Table;
use crate::types::account::AccountContext;
use crate::types::plan::AnalysisPlan;

const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_BACKOFF: Duration = Duration::from_millis(200);

/// Builds a completion backend for one batch from the caller's API key.
pub type BackendFactory = Arc<
    dyn Fn(&SecretString, &PipelineConfig) -> std::result::Result<Arc<dyn CompletionBackend>, ConfigError>
        + Send
        + Sync,
>;

fn openai_backend(
    api_key: &SecretString,
    config: &PipelineConfig,
) -> std::result::Result<Arc<dyn CompletionBackend>, ConfigError> {
    if api_key.expose_secret().trim().is_empty() {
        return Err(ConfigError::Invalid {
            key: "api_key".into(),
            value: String::new(),
            reason: "completion API key is empty".into(),
        });
    }

    let client = openai_client::OpenAIClient::new(api_key.clone())
        .with_base_url(config.openai_base_url.clone())
        .with_timeout(config.completion_timeout);
    Ok(Arc::new(client))
}

/// One batch to enrich.
pub struct BatchRequest {
    pub table: Table,
    /// Target column; detected from well-known names when absent
    pub target_column: Option<String>,
    pub plan: AnalysisPlan,
    /// Used for this batch only; never logged or stored
    pub api_key: SecretString,
    /// Process only the first `n` rows
    pub row_limit: Option<usize>,
}

impl BatchRequest {
    pub fn new(table: Table, plan: AnalysisPlan, api_key: SecretString) -> Self {
        Self {
            table,
            target_column: None,
            plan,
            api_key,
            row_limit: None,
        }
    }

    pub fn with_target_column(mut self, column: impl Into<String>) -> Self {
        self.target_column = Some(column.into());
        self
    }

    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = Some(limit);
        self
    }
}

/// Whether the batch's usage reached the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BillingStatus {
    Billed { rows: u64, used: u64, limit: u64 },
    /// Commit kept failing; the reservation is still held and needs settling
    Pending {
        rows: u64,
        reservation: Uuid,
        reason: String,
    },
}

/// Result of a finished (or cancelled) batch.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub table: Table,
    pub state: BatchSnapshot,
    pub billing: BillingStatus,
}

impl BatchOutcome {
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.table.to_csv_bytes()?)
    }
}

/// The enrichment pipeline.
///
/// Holds the long-lived collaborators. Rate limiters and the completion
/// client are built per batch.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    ledger: Arc<dyn QuotaLedger>,
    fetcher: Arc<dyn PageFetcher>,
    backend_factory: BackendFactory,
}

impl Pipeline {
    /// Pipeline with the HTTP fetcher and OpenAI backend.
    pub fn new(
        config: PipelineConfig,
        ledger: Arc<dyn QuotaLedger>,
    ) -> std::result::Result<Self, ConfigError> {
        let fetcher = Arc::new(HttpFetcher::from_config(&config)?);
        Ok(Self {
            config,
            ledger,
            fetcher,
            backend_factory: Arc::new(openai_backend),
        })
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn PageFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_backend_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&SecretString, &PipelineConfig) -> std::result::Result<Arc<dyn CompletionBackend>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.backend_factory = Arc::new(factory);
        self
    }

    /// Use one backend for every batch regardless of key.
    pub fn with_backend(self, backend: Arc<dyn CompletionBackend>) -> Self {
        self.with_backend_factory(move |_, _| Ok(backend.clone()))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Enrich one table for `account`.
    ///
    /// Quota is reserved before any fetch or completion call, so an
    /// over-quota batch fails with [`PipelineError::QuotaExceeded`] having
    /// done no network work. Completed rows are committed once.
    pub async fn run(
        &self,
        account: &AccountContext,
        request: BatchRequest,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Result<BatchOutcome> {
        let BatchRequest {
            table,
            target_column,
            plan,
            api_key,
            row_limit,
        } = request;

        let target_column = match target_column {
            Some(column) => column,
            None => table
                .find_target_column()
                .map(str::to_string)
                .ok_or_else(|| PipelineError::BatchAbort("no target column found".into()))?,
        };

        plan.validate(table.columns())?;

        let mut limit = self.config.max_batch_rows;
        if let Some(requested) = row_limit {
            limit = limit.min(requested);
        }
        if table.len() > limit {
            warn!(rows = table.len(), limit, "Batch truncated");
        }
        let table = table.head(limit);
        let rows = Arc::new(table.rows(&target_column)?);
        let total = rows.len();

        let backend = (self.backend_factory)(&api_key, &self.config)
            .map_err(|e| PipelineError::BatchAbort(e.to_string()))?;

        let reservation = self
            .ledger
            .reserve(account.account_id, total as u64)
            .await
            .map_err(|e| match e {
                QuotaError::QuotaExceeded {
                    requested,
                    remaining,
                } => PipelineError::QuotaExceeded {
                    requested,
                    remaining,
                },
                other => PipelineError::BatchAbort(other.to_string()),
            })?;

        let tier = account.tier();
        let profile = self.config.profile_for(tier);
        info!(
            account = %account.account_id,
            %tier,
            rows = total,
            workers = profile.workers,
            fetch_per_second = profile.fetch_per_second,
            "Batch accepted"
        );

        let completion = CompletionClient::from_config(backend, &self.config).with_limiter(
            Arc::new(RateLimiter::per_second(self.config.completion_per_second)),
        );
        let processor = RowProcessor::new(ProcessorDeps {
            fetcher: self.fetcher.clone(),
            extractor: ContentExtractor::new(self.config.max_content_chars),
            completion,
            fetch_limiter: Arc::new(RateLimiter::per_second(profile.fetch_per_second)),
        });

        let plan = Arc::new(plan);
        let run = BatchScheduler::new(processor)
            .run(rows.clone(), plan.clone(), profile.workers, progress, cancel)
            .await;

        let run = match run {
            Ok(run) => run,
            Err(e) => {
                if let Err(release_err) = self.ledger.release(&reservation).await {
                    error!(
                        reservation = %reservation.id,
                        error = %release_err,
                        "Failed to release reservation after abort"
                    );
                }
                return Err(e);
            }
        };

        let billing = self
            .commit_with_retry(&reservation, run.state.completed as u64)
            .await;

        let table = ResultAssembler.assemble(table.columns(), &rows, &run.results, &plan);

        Ok(BatchOutcome {
            table,
            state: run.state,
            billing,
        })
    }

    async fn commit_with_retry(&self, reservation: &Reservation, processed: u64) -> BillingStatus {
        let rows = reservation.billable(processed);
        let mut delay = COMMIT_BACKOFF;
        let mut attempt = 1;

        loop {
            match self.ledger.commit(reservation, processed).await {
                Ok(account) => {
                    return BillingStatus::Billed {
                        rows,
                        used: account.used,
                        limit: account.limit,
                    }
                }
                Err(e) if e.is_transient() && attempt < COMMIT_ATTEMPTS => {
                    warn!(attempt, error = %e, "Quota commit failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        reservation = %reservation.id,
                        rows,
                        error = %e,
                        "Quota commit failed, billing pending"
                    );
                    return BillingStatus::Pending {
                        rows,
                        reservation: reservation.id,
                        reason: e.to_string(),
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::QuotaResult;
    use crate::progress::NoProgress;
    use crate::quota::{MemoryQuotaLedger, QuotaAccount};
    use crate::testing::{MockCompletion, MockFetcher};
    use crate::types::account::AccountId;

    /// Ledger whose commits fail a set number of times before delegating.
    struct FlakyLedger {
        inner: MemoryQuotaLedger,
        commit_failures: AtomicU32,
    }

    #[async_trait]
    impl QuotaLedger for FlakyLedger {
        async fn account(&self, id: AccountId) -> QuotaResult<QuotaAccount> {
            self.inner.account(id).await
        }

        async fn reserve(&self, id: AccountId, rows: u64) -> QuotaResult<Reservation> {
            self.inner.reserve(id, rows).await
        }

        async fn commit(&self, r: &Reservation, processed: u64) -> QuotaResult<QuotaAccount> {
            let left = self.commit_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.commit_failures.store(left - 1, Ordering::SeqCst);
                return Err(QuotaError::Storage("connection reset".into()));
            }
            self.inner.commit(r, processed).await
        }

        async fn release(&self, r: &Reservation) -> QuotaResult<()> {
            self.inner.release(r).await
        }
    }

    async fn flaky_pipeline(failures: u32) -> (Pipeline, AccountContext) {
        let context = AccountContext::new(AccountId(1), 100);
        let inner = MemoryQuotaLedger::new();
        inner.register(&context).await;
        let ledger = Arc::new(FlakyLedger {
            inner,
            commit_failures: AtomicU32::new(failures),
        });

        let pipeline = Pipeline::new(PipelineConfig::default(), ledger)
            .unwrap()
            .with_fetcher(Arc::new(MockFetcher::new().with_default_page("<p>ok</p>")))
            .with_backend(Arc::new(MockCompletion::new()));
        (pipeline, context)
    }

    fn request() -> BatchRequest {
        let table = Table::from_csv_bytes(b"Websites\na.com\nb.com\n").unwrap();
        BatchRequest::new(
            table,
            AnalysisPlan::new("Summarize"),
            SecretString::from("sk-test"),
        )
    }

    #[tokio::test]
    async fn test_commit_retried_through_transient_failures() {
        let (pipeline, context) = flaky_pipeline(2).await;
        let outcome = pipeline
            .run(&context, request(), Arc::new(NoProgress), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome.billing,
            BillingStatus::Billed {
                rows: 2,
                used: 2,
                limit: 100
            }
        );
    }

    #[tokio::test]
    async fn test_persistent_commit_failure_flagged_pending() {
        let (pipeline, context) = flaky_pipeline(10).await;
        let outcome = pipeline
            .run(&context, request(), Arc::new(NoProgress), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome.billing, BillingStatus::Pending { rows: 2, .. }));
        assert_eq!(outcome.table.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_target_column_aborts() {
        let (pipeline, context) = flaky_pipeline(0).await;
        let table = Table::from_csv_bytes(b"Name\nAcme\n").unwrap();
        let request = BatchRequest::new(table, AnalysisPlan::new("x"), SecretString::from("k"));

        let result = pipeline
            .run(&context, request, Arc::new(NoProgress), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(PipelineError::BatchAbort(_))));
    }

    #[tokio::test]
    async fn test_empty_api_key_rejected_by_default_backend() {
        let ledger = Arc::new(MemoryQuotaLedger::new());
        let context = AccountContext::new(AccountId(1), 100);
        ledger.register(&context).await;

        let pipeline = Pipeline::new(PipelineConfig::default(), ledger.clone())
            .unwrap()
            .with_fetcher(Arc::new(MockFetcher::new()));
        let mut request = request();
        request.api_key = SecretString::from("  ");

        let result = pipeline
            .run(&context, request, Arc::new(NoProgress), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(PipelineError::BatchAbort(_))));
        assert_eq!(ledger.account(AccountId(1)).await.unwrap().reserved, 0);
    }

    #[tokio::test]
    async fn test_row_limit_applied_before_reserve() {
        let (pipeline, context) = flaky_pipeline(0).await;
        let outcome = pipeline
            .run(
                &context,
                request().with_row_limit(1),
                Arc::new(NoProgress),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.table.len(), 1);
        assert_eq!(outcome.state.total, 1);
        assert!(matches!(outcome.billing, BillingStatus::Billed { rows: 1, .. }));
    }
}
