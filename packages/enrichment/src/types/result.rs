//! Per-row outputs.

use crate::error::{CompletionError, FetchError};
use crate::types::row::RowId;

/// A fetched page before extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    /// The normalized URL that was requested
    pub url: String,
    /// URL after redirects
    pub final_url: String,
    pub status: u16,
    pub body: String,
    pub content_type: Option<String>,
}

impl RawPage {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            status: 200,
            body: body.into(),
            content_type: Some("text/html".to_string()),
        }
    }

    pub fn with_final_url(mut self, final_url: impl Into<String>) -> Self {
        self.final_url = final_url.into();
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}

/// Outcome of fetching and extracting one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeResult {
    pub success: bool,
    /// Bounded extracted text; empty on failure
    pub text: String,
    pub error: Option<FetchError>,
}

impl ScrapeResult {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
            error: None,
        }
    }

    pub fn failed(error: FetchError) -> Self {
        Self {
            success: false,
            text: String::new(),
            error: Some(error),
        }
    }
}

/// One completion to run for a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub content: String,
    pub instructions: String,
    pub output_field_name: String,
}

/// Result of one [`AnalysisRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisResult {
    pub field_name: String,
    pub text: String,
    pub error: Option<CompletionError>,
}

impl AnalysisResult {
    pub fn ok(field_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            text: text.into(),
            error: None,
        }
    }

    pub fn failed(field_name: impl Into<String>, error: CompletionError) -> Self {
        Self {
            field_name: field_name.into(),
            text: String::new(),
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Everything produced for one input row.
///
/// Built by exactly one worker and never mutated after it is handed to the
/// accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowResult {
    pub row_id: RowId,
    pub target: String,
    pub scrape: ScrapeResult,
    /// In request order: primary analysis first, then additional columns
    pub analyses: Vec<AnalysisResult>,
}

impl RowResult {
    /// Row-level error: the fetch failure, if any.
    pub fn row_error(&self) -> Option<&FetchError> {
        self.scrape.error.as_ref()
    }

    /// Whether the row counts toward `error_count`.
    pub fn is_error(&self) -> bool {
        self.row_error().is_some() || self.analyses.iter().any(AnalysisResult::is_error)
    }

    /// Text for a named analysis field; empty when the field failed.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.analyses
            .iter()
            .find(|a| a.field_name == name)
            .map(|a| a.text.as_str())
    }

    /// Message for the `Error` column.
    ///
    /// The fetch error when the row could not be fetched, otherwise one
    /// `field: message` entry per failed analysis joined by `"; "`.
    pub fn error_message(&self) -> Option<String> {
        if let Some(err) = self.row_error() {
            return Some(err.to_string());
        }

        let failures: Vec<String> = self
            .analyses
            .iter()
            .filter_map(|a| {
                a.error
                    .as_ref()
                    .map(|e| format!("{}: {}", a.field_name, e))
            })
            .collect();

        if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        }
    }
}
