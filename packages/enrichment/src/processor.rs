//! Fetch, extract, and analyse a single row.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::completion::CompletionClient;
use crate::error::CompletionError;
use crate::extractor::ContentExtractor;
use crate::fetcher::{normalize_target, PageFetcher};
use crate::prompts::format_analysis_prompt;
use crate::rate_limit::RateLimiter;
use crate::types::plan::AnalysisPlan;
use crate::types::result::{AnalysisRequest, AnalysisResult, RowResult, ScrapeResult};
use crate::types::row::Row;

/// Everything a worker needs to process rows.
///
/// The completion client carries its own limiter.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub fetcher: Arc<dyn PageFetcher>,
    pub extractor: ContentExtractor,
    pub completion: CompletionClient,
    pub fetch_limiter: Arc<RateLimiter>,
}

/// Turns one [`Row`] into one [`RowResult`].
#[derive(Clone)]
pub struct RowProcessor {
    deps: ProcessorDeps,
}

impl RowProcessor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }

    /// Process one row.
    ///
    /// A fetch failure yields a result carrying that error and no
    /// completion calls. Otherwise every analysis runs concurrently and a
    /// failing field never blanks the others.
    ///
    /// Returns `None` when `cancel` interrupted the row while it waited for
    /// a permit or a retry. Such a row has no result and is not counted.
    pub async fn process(
        &self,
        row: &Row,
        plan: &AnalysisPlan,
        cancel: &CancellationToken,
    ) -> Option<RowResult> {
        let scrape = self.scrape(row, cancel).await?;

        if !scrape.success {
            return Some(RowResult {
                row_id: row.id(),
                target: row.target().to_string(),
                scrape,
                analyses: Vec::new(),
            });
        }

        let requests = plan.requests_for(row, &scrape.text);
        let analyses = join_all(
            requests
                .iter()
                .map(|request| self.analyse(request, &plan.model, cancel)),
        )
        .await;

        if analyses
            .iter()
            .any(|a| a.error == Some(CompletionError::Cancelled))
        {
            debug!(row = %row.id(), target = %row.target(), "Row interrupted by cancellation");
            return None;
        }

        debug!(
            row = %row.id(),
            target = %row.target(),
            fields = analyses.len(),
            failed = analyses.iter().filter(|a| a.is_error()).count(),
            "Row processed"
        );

        Some(RowResult {
            row_id: row.id(),
            target: row.target().to_string(),
            scrape,
            analyses,
        })
    }

    async fn scrape(&self, row: &Row, cancel: &CancellationToken) -> Option<ScrapeResult> {
        // Bad targets fail without spending a fetch permit
        if let Err(e) = normalize_target(row.target()) {
            warn!(row = %row.id(), error = %e, "Invalid target");
            return Some(ScrapeResult::failed(e));
        }

        if !self.deps.fetch_limiter.acquire_until(cancel).await {
            return None;
        }

        let scrape = match self.deps.fetcher.fetch(row.target()).await {
            Ok(page) => ScrapeResult::ok(self.deps.extractor.extract(&page)),
            Err(e) => {
                warn!(row = %row.id(), target = %row.target(), error = %e, "Fetch failed");
                ScrapeResult::failed(e)
            }
        };
        Some(scrape)
    }

    async fn analyse(
        &self,
        request: &AnalysisRequest,
        model: &str,
        cancel: &CancellationToken,
    ) -> AnalysisResult {
        let prompt = format_analysis_prompt(request);

        match self.deps.completion.complete(&prompt, model, cancel).await {
            Ok(text) => AnalysisResult::ok(&request.output_field_name, text),
            Err(CompletionError::Cancelled) => {
                AnalysisResult::failed(&request.output_field_name, CompletionError::Cancelled)
            }
            Err(e) => {
                warn!(field = %request.output_field_name, error = %e, "Analysis failed");
                AnalysisResult::failed(&request.output_field_name, e)
            }
        }
    }
}
