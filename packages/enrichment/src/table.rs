//! CSV input and output tables.

use std::collections::HashSet;
use std::io::Read;

use indexmap::IndexMap;

use crate::error::TableError;
use crate::types::row::{Row, RowId};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Column names accepted as the target column, in priority order.
pub const TARGET_COLUMN_NAMES: &[&str] = &[
    "Websites",
    "websites",
    "Sites",
    "sites",
    "Domains",
    "domains",
    "company_website",
    "companywebsite",
];

/// A rectangular table of string cells with named columns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    /// Build a table; short rows are padded and long rows cut to the header.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Read CSV with a header row.
    ///
    /// `Unnamed:*` index columns and columns empty in every row are dropped.
    /// Repeated header names get `.1`, `.2` suffixes.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self, TableError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                if i == 0 {
                    h.trim_start_matches('\u{feff}').to_string()
                } else {
                    h.to_string()
                }
            })
            .collect();

        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(TableError::NoHeader);
        }

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        let mut table = Self::new(dedupe_names(headers), rows);
        table.drop_columns(|name, _| name.starts_with("Unnamed:"));
        table.drop_empty_columns();
        Ok(table)
    }

    pub fn from_csv_bytes(bytes: &[u8]) -> Result<Self, TableError> {
        let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        Self::from_csv_reader(bytes)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell value by row index and column name.
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.column_index(column)?;
        self.rows.get(row).map(|r| r[index].as_str())
    }

    /// All values of one column, top to bottom.
    pub fn column_values(&self, column: &str) -> Option<Vec<&str>> {
        let index = self.column_index(column)?;
        Some(self.rows.iter().map(|r| r[index].as_str()).collect())
    }

    /// The first recognised target column present in the table.
    pub fn find_target_column(&self) -> Option<&str> {
        TARGET_COLUMN_NAMES
            .iter()
            .find(|name| self.column_index(name).is_some())
            .copied()
    }

    /// The first `n` rows.
    pub fn head(&self, n: usize) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Convert to pipeline rows using `target_column` as the target.
    pub fn rows(&self, target_column: &str) -> Result<Vec<Row>, TableError> {
        let target_index = self
            .column_index(target_column)
            .ok_or_else(|| TableError::MissingColumn(target_column.to_string()))?;

        Ok(self
            .rows
            .iter()
            .enumerate()
            .map(|(i, cells)| {
                let fields: IndexMap<String, String> = self
                    .columns
                    .iter()
                    .cloned()
                    .zip(cells.iter().cloned())
                    .collect();
                Row::new(RowId(i), fields, cells[target_index].trim())
            })
            .collect())
    }

    /// Remove columns whose cells are all blank.
    pub fn drop_empty_columns(&mut self) {
        let empty: HashSet<usize> = (0..self.columns.len())
            .filter(|&i| self.rows.iter().all(|r| r[i].trim().is_empty()))
            .collect();
        self.drop_columns(|_, i| empty.contains(&i));
    }

    fn drop_columns<F>(&mut self, mut drop: F)
    where
        F: FnMut(&str, usize) -> bool,
    {
        let keep: Vec<bool> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, name)| !drop(name, i))
            .collect();

        if keep.iter().all(|k| *k) {
            return;
        }

        let filter = |cells: &mut Vec<String>| {
            let mut i = 0;
            cells.retain(|_| {
                let kept = keep[i];
                i += 1;
                kept
            });
        };

        filter(&mut self.columns);
        for row in &mut self.rows {
            filter(row);
        }
    }

    /// Write CSV with a UTF-8 BOM, so spreadsheet tools detect the encoding.
    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, TableError> {
        let mut buffer = UTF8_BOM.to_vec();
        {
            let mut writer = csv::Writer::from_writer(&mut buffer);
            writer.write_record(&self.columns)?;
            for row in &self.rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
        }
        Ok(buffer)
    }
}

fn dedupe_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    names
        .into_iter()
        .map(|name| {
            if seen.insert(name.clone()) {
                return name;
            }
            let mut n = 1;
            loop {
                let candidate = format!("{}.{}", name, n);
                if seen.insert(candidate.clone()) {
                    return candidate;
                }
                n += 1;
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_and_cleans_columns() {
        let csv = "\u{feff}Unnamed: 0,Websites,Company,Notes\n0,acme.com,Acme,\n1,globex.com,Globex,\n";
        let table = Table::from_csv_bytes(csv.as_bytes()).unwrap();

        assert_eq!(table.columns(), &["Websites", "Company"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(1, "Company"), Some("Globex"));
    }

    #[test]
    fn test_ragged_rows_padded() {
        let table = Table::from_csv_bytes(b"Websites,Company\na.com\nb.com,B,extra\n").unwrap();
        assert_eq!(table.cell(0, "Company"), Some(""));
        assert_eq!(table.cell(1, "Company"), Some("B"));
    }

    #[test]
    fn test_duplicate_headers_renamed() {
        let table = Table::from_csv_bytes(b"Websites,Name,Name\na.com,x,y\n").unwrap();
        assert_eq!(table.columns(), &["Websites", "Name", "Name.1"]);
    }

    #[test]
    fn test_empty_input_has_no_header() {
        assert!(matches!(
            Table::from_csv_bytes(b""),
            Err(TableError::NoHeader)
        ));
    }

    #[test]
    fn test_find_target_column() {
        let table = Table::from_csv_bytes(b"Name,domains\nAcme,acme.com\n").unwrap();
        assert_eq!(table.find_target_column(), Some("domains"));

        let table = Table::from_csv_bytes(b"Name,url\nAcme,acme.com\n").unwrap();
        assert_eq!(table.find_target_column(), None);
    }

    #[test]
    fn test_rows_carry_ids_and_targets() {
        let table =
            Table::from_csv_bytes(b"Websites,Company\n acme.com ,Acme\nacme.com,Acme Two\n").unwrap();
        let rows = table.rows("Websites").unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id(), RowId(0));
        assert_eq!(rows[0].target(), "acme.com");
        assert_eq!(rows[1].id(), RowId(1));
        assert_eq!(rows[1].get("Company"), Some("Acme Two"));

        assert!(matches!(
            table.rows("Sites"),
            Err(TableError::MissingColumn(c)) if c == "Sites"
        ));
    }

    #[test]
    fn test_head() {
        let table = Table::from_csv_bytes(b"Websites\na.com\nb.com\nc.com\n").unwrap();
        assert_eq!(table.head(2).len(), 2);
        assert_eq!(table.head(10).len(), 3);
    }

    #[test]
    fn test_csv_output_has_bom_and_quotes() {
        let table = Table::new(
            vec!["Websites".into(), "Analysis".into()],
            vec![vec!["a.com".into(), "one, two".into()]],
        );
        let bytes = table.to_csv_bytes().unwrap();

        assert!(bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
        assert!(text.starts_with("Websites,Analysis"));
        assert!(text.contains("a.com,\"one, two\""));

        let reread = Table::from_csv_bytes(&table.to_csv_bytes().unwrap()).unwrap();
        assert_eq!(reread, table);
    }
}
