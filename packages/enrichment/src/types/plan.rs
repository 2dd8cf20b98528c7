//! What to ask the model for each row.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::prompts::NO_CONTENT;
use crate::types::result::AnalysisRequest;
use crate::types::row::Row;

/// Output column holding the extracted page text.
pub const SCRAPED_CONTENT_COLUMN: &str = "Scraped_Content";

/// Output column holding the primary analysis.
pub const ANALYSIS_COLUMN: &str = "Analysis";

/// Output column holding row errors.
pub const ERROR_COLUMN: &str = "Error";

/// Column names the pipeline writes itself.
pub const RESERVED_COLUMNS: [&str; 3] = [SCRAPED_CONTENT_COLUMN, ANALYSIS_COLUMN, ERROR_COLUMN];

/// Model used when the caller does not pick one.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// An extra output column with its own instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalColumn {
    pub name: String,
    pub instructions: String,
}

impl AdditionalColumn {
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
        }
    }
}

/// Instructions, extra columns, and model for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisPlan {
    /// Primary instructions; no `Analysis` request is made when blank
    pub instructions: String,
    #[serde(default)]
    pub additional_columns: Vec<AdditionalColumn>,
    pub model: String,
    /// Original columns whose values are added to every prompt
    #[serde(default)]
    pub context_columns: Vec<String>,
}

impl AnalysisPlan {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            additional_columns: Vec::new(),
            model: DEFAULT_MODEL.to_string(),
            context_columns: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_column(mut self, column: AdditionalColumn) -> Self {
        self.additional_columns.push(column);
        self
    }

    pub fn with_context_columns(mut self, columns: Vec<String>) -> Self {
        self.context_columns = columns;
        self
    }

    pub fn has_primary(&self) -> bool {
        !self.instructions.trim().is_empty()
    }

    /// Analysis columns this plan produces, in output order.
    pub fn output_columns(&self) -> Vec<&str> {
        let mut columns = Vec::with_capacity(self.additional_columns.len() + 1);
        if self.has_primary() {
            columns.push(ANALYSIS_COLUMN);
        }
        columns.extend(self.additional_columns.iter().map(|c| c.name.as_str()));
        columns
    }

    /// Check the plan against the input table's columns.
    ///
    /// Additional columns need non-empty unique names and non-empty
    /// instructions, and may not reuse an original or reserved column name.
    /// Context columns must exist in the input.
    pub fn validate(&self, original_columns: &[String]) -> Result<(), PipelineError> {
        if !self.has_primary() && self.additional_columns.is_empty() {
            return Err(PipelineError::InvalidColumns(
                "no instructions or additional columns given".into(),
            ));
        }

        let originals: HashSet<&str> = original_columns.iter().map(String::as_str).collect();
        let mut seen = HashSet::new();

        for column in &self.additional_columns {
            let name = column.name.trim();
            if name.is_empty() {
                return Err(PipelineError::InvalidColumns(
                    "additional column name is empty".into(),
                ));
            }
            if name != column.name {
                return Err(PipelineError::InvalidColumns(format!(
                    "column name {:?} has surrounding whitespace",
                    column.name
                )));
            }
            if column.instructions.trim().is_empty() {
                return Err(PipelineError::InvalidColumns(format!(
                    "column {} has no instructions",
                    name
                )));
            }
            if RESERVED_COLUMNS.contains(&name) {
                return Err(PipelineError::InvalidColumns(format!(
                    "column {} is reserved",
                    name
                )));
            }
            if originals.contains(name) {
                return Err(PipelineError::InvalidColumns(format!(
                    "column {} already exists in the input",
                    name
                )));
            }
            if !seen.insert(name) {
                return Err(PipelineError::InvalidColumns(format!(
                    "column {} is defined twice",
                    name
                )));
            }
        }

        for context in &self.context_columns {
            if !originals.contains(context.as_str()) {
                return Err(PipelineError::InvalidColumns(format!(
                    "context column {} not found in input",
                    context
                )));
            }
        }

        Ok(())
    }

    /// Build the completion requests for one row, primary first.
    pub fn requests_for(&self, row: &Row, content: &str) -> Vec<AnalysisRequest> {
        let content = self.with_context(row, content);
        let mut requests = Vec::with_capacity(self.additional_columns.len() + 1);

        if self.has_primary() {
            requests.push(AnalysisRequest {
                content: content.clone(),
                instructions: self.instructions.clone(),
                output_field_name: ANALYSIS_COLUMN.to_string(),
            });
        }

        for column in &self.additional_columns {
            requests.push(AnalysisRequest {
                content: content.clone(),
                instructions: column.instructions.clone(),
                output_field_name: column.name.clone(),
            });
        }

        requests
    }

    fn with_context(&self, row: &Row, content: &str) -> String {
        let lines: Vec<String> = self
            .context_columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c, v)))
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(c, v)| format!("{}: {}", c, v))
            .collect();

        if lines.is_empty() {
            return content.to_string();
        }

        let content = if content.trim().is_empty() {
            NO_CONTENT
        } else {
            content
        };
        format!("{}\n\nRow data:\n{}", content, lines.join("\n"))
    }
}
