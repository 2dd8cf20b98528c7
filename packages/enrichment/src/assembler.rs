//! Merge row results back onto the input rows.

use std::collections::HashMap;

use crate::table::Table;
pub use crate::types::plan::{ANALYSIS_COLUMN, ERROR_COLUMN, SCRAPED_CONTENT_COLUMN};
use crate::types::plan::AnalysisPlan;
use crate::types::result::RowResult;
use crate::types::row::{Row, RowId};

/// Builds the output table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultAssembler;

impl ResultAssembler {
    /// Left-join `results` onto `rows` by [`RowId`].
    ///
    /// The output has one row per input row, in input order. Columns are the
    /// original columns, `Scraped_Content`, the plan's analysis columns, then
    /// `Error` when any row failed. Columns blank in every row are dropped.
    /// Rows with no result (cancelled batches) get blank output cells.
    pub fn assemble(
        &self,
        original_columns: &[String],
        rows: &[Row],
        results: &[RowResult],
        plan: &AnalysisPlan,
    ) -> Table {
        let by_id: HashMap<RowId, &RowResult> = results.iter().map(|r| (r.row_id, r)).collect();
        let analysis_columns = plan.output_columns();
        let errors: Vec<Option<String>> = rows
            .iter()
            .map(|row| by_id.get(&row.id()).and_then(|r| r.error_message()))
            .collect();
        let has_errors = errors.iter().any(Option::is_some);

        let mut columns: Vec<String> = original_columns.to_vec();
        columns.push(SCRAPED_CONTENT_COLUMN.to_string());
        columns.extend(analysis_columns.iter().map(|c| c.to_string()));
        if has_errors {
            columns.push(ERROR_COLUMN.to_string());
        }

        let cells = rows
            .iter()
            .zip(errors)
            .map(|(row, error)| {
                let result = by_id.get(&row.id());
                let mut cells: Vec<String> = original_columns
                    .iter()
                    .map(|c| row.get(c).unwrap_or_default().to_string())
                    .collect();

                cells.push(
                    result
                        .map(|r| r.scrape.text.clone())
                        .unwrap_or_default(),
                );
                for column in &analysis_columns {
                    cells.push(
                        result
                            .and_then(|r| r.field(column))
                            .unwrap_or_default()
                            .to_string(),
                    );
                }
                if has_errors {
                    cells.push(error.unwrap_or_default());
                }
                cells
            })
            .collect();

        let mut table = Table::new(columns, cells);
        table.drop_empty_columns();
        table
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use super::*;
    use crate::error::{CompletionError, FetchError};
    use crate::types::plan::AdditionalColumn;
    use crate::types::result::{AnalysisResult, ScrapeResult};

    fn columns() -> Vec<String> {
        vec!["Websites".into(), "Company".into()]
    }

    fn row(i: usize, target: &str) -> Row {
        let mut fields = IndexMap::new();
        fields.insert("Websites".to_string(), target.to_string());
        fields.insert("Company".to_string(), format!("Co {}", i));
        Row::new(RowId(i), fields, target)
    }

    fn ok_result(i: usize, target: &str, analyses: Vec<AnalysisResult>) -> RowResult {
        RowResult {
            row_id: RowId(i),
            target: target.into(),
            scrape: ScrapeResult::ok(format!("text {}", i)),
            analyses,
        }
    }

    #[test]
    fn test_restores_input_order_and_joins_duplicates_by_id() {
        let rows = vec![row(0, "dup.com"), row(1, "dup.com"), row(2, "c.com")];
        let plan = AnalysisPlan::new("Summarize");
        // Arrival order differs from input order
        let results = vec![
            ok_result(2, "c.com", vec![AnalysisResult::ok("Analysis", "two")]),
            ok_result(0, "dup.com", vec![AnalysisResult::ok("Analysis", "zero")]),
            ok_result(1, "dup.com", vec![AnalysisResult::ok("Analysis", "one")]),
        ];

        let table = ResultAssembler.assemble(&columns(), &rows, &results, &plan);

        assert_eq!(
            table.columns(),
            &["Websites", "Company", "Scraped_Content", "Analysis"]
        );
        assert_eq!(table.column_values("Analysis").unwrap(), vec!["zero", "one", "two"]);
        assert_eq!(table.cell(1, "Company"), Some("Co 1"));
    }

    #[test]
    fn test_error_column_and_failed_fields() {
        let rows = vec![row(0, "a.com"), row(1, "down.com")];
        let plan = AnalysisPlan::new("Summarize")
            .with_column(AdditionalColumn::new("Industry", "Which industry?"));
        let results = vec![
            ok_result(
                0,
                "a.com",
                vec![
                    AnalysisResult::ok("Analysis", "fine"),
                    AnalysisResult::failed("Industry", CompletionError::Fatal("nope".into())),
                ],
            ),
            RowResult {
                row_id: RowId(1),
                target: "down.com".into(),
                scrape: ScrapeResult::failed(FetchError::Timeout {
                    url: "https://down.com/".into(),
                }),
                analyses: vec![],
            },
        ];

        let table = ResultAssembler.assemble(&columns(), &rows, &results, &plan);

        assert_eq!(
            table.columns(),
            &["Websites", "Company", "Scraped_Content", "Analysis", "Error"]
        );
        assert_eq!(table.cell(0, "Analysis"), Some("fine"));
        assert_eq!(table.cell(0, "Error"), Some("Industry: completion failed: nope"));
        assert_eq!(table.cell(1, "Scraped_Content"), Some(""));
        assert_eq!(table.cell(1, "Error"), Some("timed out fetching https://down.com/"));
    }

    #[test]
    fn test_no_error_column_when_clean() {
        let rows = vec![row(0, "a.com")];
        let plan = AnalysisPlan::new("Summarize");
        let results = vec![ok_result(0, "a.com", vec![AnalysisResult::ok("Analysis", "x")])];

        let table = ResultAssembler.assemble(&columns(), &rows, &results, &plan);
        assert!(!table.columns().iter().any(|c| c == "Error"));
    }

    #[test]
    fn test_missing_results_keep_row_count() {
        let rows = vec![row(0, "a.com"), row(1, "b.com"), row(2, "c.com")];
        let plan = AnalysisPlan::new("Summarize");
        let results = vec![ok_result(0, "a.com", vec![AnalysisResult::ok("Analysis", "x")])];

        let table = ResultAssembler.assemble(&columns(), &rows, &results, &plan);

        assert_eq!(table.len(), 3);
        assert_eq!(table.cell(2, "Analysis"), Some(""));
        assert_eq!(table.cell(2, "Websites"), Some("c.com"));
    }
}
