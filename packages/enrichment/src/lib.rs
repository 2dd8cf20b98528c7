//! Website enrichment pipeline
//!
//! Takes a table of target websites and, for every row, fetches the page,
//! extracts its text, and asks a language model one or more questions about
//! it. Rows fail independently; a batch only aborts on quota or scheduler
//! faults.
//!
//! # Usage
//!
//! ```rust,ignore
//! use enrichment::{AccountContext, AccountId, AnalysisPlan, BatchRequest, MemoryQuotaLedger, Pipeline, PipelineConfig, Table};
//!
//! let ledger = Arc::new(MemoryQuotaLedger::new());
//! let account = AccountContext::new(AccountId(1), 1_000);
//! ledger.register(&account).await;
//!
//! let pipeline = Pipeline::new(PipelineConfig::from_env()?, ledger)?;
//! let request = BatchRequest::new(Table::from_csv_bytes(&csv)?, AnalysisPlan::new("What do they sell?"), api_key);
//! let outcome = pipeline.run(&account, request, Arc::new(NoProgress), CancellationToken::new()).await?;
//! std::fs::write("out.csv", outcome.to_csv_bytes()?)?;
//! ```
//!
//! # Modules
//!
//! - [`fetcher`] - Single-attempt page fetching
//! - [`extractor`] - HTML to bounded plain text
//! - [`completion`] - Completion requests with retry
//! - [`rate_limit`] - Shared request pacing
//! - [`processor`] - One row end to end
//! - [`scheduler`] - Worker pool, progress, cancellation
//! - [`quota`] - Reserve/commit usage accounting
//! - [`assembler`] - Output table construction
//! - [`pipeline`] - Batch entry point
//! - [`testing`] - Mock backends

pub mod assembler;
pub mod completion;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod pipeline;
pub mod processor;
pub mod progress;
pub mod prompts;
pub mod quota;
pub mod rate_limit;
pub mod scheduler;
pub mod table;
pub mod testing;
pub mod types;

pub use assembler::ResultAssembler;
pub use completion::{CompletionBackend, CompletionClient};
pub use config::{PipelineConfig, RetryPolicy, TierProfile};
pub use error::{
    CompletionError, ConfigError, FetchError, PipelineError, QuotaError, Result, TableError,
};
pub use extractor::ContentExtractor;
pub use fetcher::{normalize_target, HttpFetcher, PageFetcher};
pub use pipeline::{BatchOutcome, BatchRequest, BillingStatus, Pipeline};
pub use processor::{ProcessorDeps, RowProcessor};
pub use progress::{from_fn, NoProgress, ProgressEvent, ProgressSink};
pub use quota::{MemoryQuotaLedger, QuotaLedger, Reservation};
#[cfg(feature = "postgres")]
pub use quota::PostgresQuotaLedger;
pub use rate_limit::RateLimiter;
pub use scheduler::{BatchRun, BatchScheduler, BatchSnapshot, BatchState};
pub use table::Table;
pub use types::{
    account::{AccountContext, AccountId, QuotaAccount, ServiceTier},
    plan::{AdditionalColumn, AnalysisPlan},
    result::{AnalysisRequest, AnalysisResult, RawPage, RowResult, ScrapeResult},
    row::{Row, RowId},
};

pub use secrecy::SecretString;
pub use tokio_util::sync::CancellationToken;
