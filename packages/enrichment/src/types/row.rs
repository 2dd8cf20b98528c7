//! Input rows.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Zero-based position of a row in the input table.
///
/// Used as the join key when results are merged back, so two rows with the
/// same target never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowId(pub usize);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One input row: its original columns in order plus the designated target.
///
/// Rows are immutable once read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    id: RowId,
    fields: IndexMap<String, String>,
    target: String,
}

impl Row {
    pub fn new(id: RowId, fields: IndexMap<String, String>, target: impl Into<String>) -> Self {
        Self {
            id,
            fields,
            target: target.into(),
        }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    /// The URL or domain to fetch, as written in the input.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn fields(&self) -> &IndexMap<String, String> {
        &self.fields
    }

    /// Value of an original column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }
}
