//! Prompt templates for row analysis.

use crate::types::result::AnalysisRequest;

/// System message sent with every completion.
pub const SYSTEM_PROMPT: &str = "You are a data analysis assistant.";

/// Placeholder content when extraction found no text.
pub const NO_CONTENT: &str = "(No readable content was found on this page.)";

/// Render the user prompt for one analysis request.
pub fn format_analysis_prompt(request: &AnalysisRequest) -> String {
    let content = if request.content.trim().is_empty() {
        NO_CONTENT
    } else {
        request.content.as_str()
    };

    format!(
        "Analyze the following content based on the instructions:\n{}\n\nContent: {}",
        request.instructions.trim(),
        content
    )
}
