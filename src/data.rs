//! # Data Loading and Table Model
//!
//! This module is the entry point for user-provided data. It reads one
//! delimited file with `polars`, factor-encodes the columns the caller names,
//! and hands the rest of the crate a dense, owned `Table`.
//!
//! - Positional layout: response and feature columns are addressed by their
//!   1-based position in the file, never by name. The first `N` columns are
//!   responses and a contiguous block of columns are features.
//! - Factor encoding: a named column is mapped to integer codes `0..k`, with
//!   its levels sorted lexicographically. The levels travel with every table
//!   derived from the source so downstream steps can recover them.
//! - User-centric errors: failures are assumed to be input errors and every
//!   `DataError` names the offending column.

use ahash::AHashSet;
use ndarray::{Array2, ArrayView1, Axis};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for data loading, validation and layout failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The column '{0}' was not found in the table.")]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to a number. Declare it as a factor if it is categorical. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in column '{0}'. Complete data is required."
    )]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Input file contains only {found} data rows, but at least {required} are required.")]
    InsufficientRows { found: usize, required: usize },
    #[error("The column name '{0}' appears more than once.")]
    DuplicateColumn(String),
    #[error("Table has {names} column names but {values} value columns.")]
    ShapeMismatch { names: usize, values: usize },
    #[error("Invalid column layout: {0}")]
    InvalidLayout(String),
}

/// Field delimiter of the input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Separator {
    #[default]
    Tab,
    Comma,
}

impl Separator {
    fn byte(self) -> u8 {
        match self {
            Separator::Tab => b'\t',
            Separator::Comma => b',',
        }
    }
}

/// Options controlling how a file becomes a `Table`.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub separator: Separator,
    /// Columns to factor-encode. Any other non-numeric column is an error.
    pub factors: Vec<String>,
    pub minimum_rows: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            separator: Separator::Tab,
            factors: Vec::new(),
            minimum_rows: 10,
        }
    }
}

/// A dense numeric table. Rows are observations.
///
/// Factor columns store integer codes; `levels` maps such a column's name to the
/// labels behind the codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    values: Array2<f64>,
    #[serde(default)]
    levels: HashMap<String, Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> Result<Self, DataError> {
        if columns.len() != values.ncols() {
            return Err(DataError::ShapeMismatch {
                names: columns.len(),
                values: values.ncols(),
            });
        }
        let mut seen = AHashSet::with_capacity(columns.len());
        for name in &columns {
            if !seen.insert(name.as_str()) {
                return Err(DataError::DuplicateColumn(name.clone()));
            }
        }
        Ok(Self {
            columns,
            values,
            levels: HashMap::new(),
        })
    }

    /// Attaches factor levels to an existing column.
    pub fn with_levels(mut self, column: &str, levels: Vec<String>) -> Result<Self, DataError> {
        if self.column_index(column).is_none() {
            return Err(DataError::ColumnNotFound(column.to_string()));
        }
        self.levels.insert(column.to_string(), levels);
        Ok(self)
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, DataError> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))?;
        Ok(self.values.column(idx))
    }

    pub fn levels(&self, name: &str) -> Option<&[String]> {
        self.levels.get(name).map(Vec::as_slice)
    }

    pub fn is_factor(&self, name: &str) -> bool {
        self.levels.contains_key(name)
    }

    /// Copies the given rows, in the given order, into a new table.
    pub fn select_rows(&self, rows: &[usize]) -> Table {
        Table {
            columns: self.columns.clone(),
            values: self.values.select(Axis(0), rows),
            levels: self.levels.clone(),
        }
    }

    /// Copies the columns at the given 0-based positions into a new table,
    /// keeping the factor levels of the columns that survive.
    pub fn select_columns(&self, positions: &[usize]) -> Table {
        let columns: Vec<String> = positions.iter().map(|&p| self.columns[p].clone()).collect();
        let levels = columns
            .iter()
            .filter_map(|c| self.levels.get(c).map(|l| (c.clone(), l.clone())))
            .collect();
        Table {
            columns,
            values: self.values.select(Axis(1), positions),
            levels,
        }
    }
}

/// Positional roles of the columns of the source table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnLayout {
    /// Number of leading response columns (positions `1..=responses`).
    pub responses: usize,
    /// Inclusive, 1-based range of feature column positions.
    pub features: (usize, usize),
}

impl ColumnLayout {
    /// Checks the layout against a table with `ncols` columns.
    pub fn validate(&self, ncols: usize) -> Result<(), DataError> {
        let (first, last) = self.features;
        if self.responses == 0 {
            return Err(DataError::InvalidLayout(
                "at least one response column is required".to_string(),
            ));
        }
        if first == 0 || first > last {
            return Err(DataError::InvalidLayout(format!(
                "feature range {first}..={last} is empty or not 1-based"
            )));
        }
        if self.responses > ncols || last > ncols {
            return Err(DataError::InvalidLayout(format!(
                "layout needs {} columns but the table has {ncols}",
                self.responses.max(last)
            )));
        }
        if first <= self.responses {
            return Err(DataError::InvalidLayout(format!(
                "feature range {first}..={last} overlaps response columns 1..={}",
                self.responses
            )));
        }
        Ok(())
    }

    /// 0-based positions of the feature columns.
    pub fn feature_positions(&self) -> Vec<usize> {
        (self.features.0 - 1..self.features.1).collect()
    }

    pub fn n_features(&self) -> usize {
        self.features.1 + 1 - self.features.0
    }
}

/// Loads a delimited file with a header row into a `Table`.
pub fn load_table(path: &Path, options: &LoadOptions) -> Result<Table, DataError> {
    log::info!("Loading data from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(
                    CsvParseOptions::default().with_separator(options.separator.byte()),
                ),
        )
        .finish()?;

    if df.height() < options.minimum_rows {
        return Err(DataError::InsufficientRows {
            found: df.height(),
            required: options.minimum_rows,
        });
    }

    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();

    for factor in &options.factors {
        if !names.contains(factor) {
            return Err(DataError::ColumnNotFound(factor.clone()));
        }
    }

    let n = df.height();
    let mut buffer = Vec::with_capacity(n * names.len());
    let mut levels = HashMap::new();
    for name in &names {
        if options.factors.contains(name) {
            let (codes, column_levels) = internal::encode_factor(&df, name)?;
            buffer.extend(codes);
            levels.insert(name.clone(), column_levels);
        } else {
            buffer.extend(internal::extract_numeric_column(&df, name)?);
        }
    }

    // The buffer is column-major, so build the transpose and flip it.
    let values = Array2::from_shape_vec((names.len(), n), buffer)
        .map_err(|_| DataError::ShapeMismatch {
            names: names.len(),
            values: 0,
        })?
        .reversed_axes()
        .as_standard_layout()
        .to_owned();

    let mut table = Table::new(names, values)?;
    for (name, column_levels) in levels {
        table = table.with_levels(&name, column_levels)?;
    }

    log::info!(
        "Loaded {} rows and {} columns ({} factor-encoded).",
        table.nrows(),
        table.ncols(),
        options.factors.len()
    );
    Ok(table)
}

mod internal {
    use super::*;

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        };

        if matches!(series.dtype(), DataType::String) {
            return Err(wrong_type());
        }
        let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        if casted.null_count() > 0 {
            return Err(wrong_type());
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    /// Encodes a column as factor codes. Levels are the sorted distinct labels.
    pub(super) fn encode_factor(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<(Vec<f64>, Vec<String>), DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let as_text = series.cast(&DataType::String)?;
        let labels: Vec<String> = as_text
            .str()?
            .into_iter()
            .map(|v| v.map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| DataError::MissingValuesFound(column_name.to_string()))?;

        let levels: Vec<String> = labels
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let codes = labels
            .iter()
            .map(|label| {
                levels
                    .binary_search(label)
                    .map(|code| code as f64)
                    .unwrap_or(f64::NAN)
            })
            .collect();
        Ok((codes, levels))
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_test_file(content: &str) -> io::Result<NamedTempFile> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    fn sample_content(rows: usize) -> String {
        let mut lines = vec!["presence\thabitat\televation\tslope".to_string()];
        for i in 0..rows {
            let habitat = if i % 3 == 0 { "wetland" } else { "forest" };
            lines.push(format!(
                "{}\t{}\t{:.1}\t{:.2}",
                i % 2,
                habitat,
                100.0 + i as f64,
                i as f64 / 10.0
            ));
        }
        lines.join("\n")
    }

    #[test]
    fn test_load_table_with_factor_column() {
        let file = create_test_file(&sample_content(12)).unwrap();
        let options = LoadOptions {
            factors: vec!["habitat".to_string()],
            ..LoadOptions::default()
        };
        let table = load_table(file.path(), &options).unwrap();

        assert_eq!(table.nrows(), 12);
        assert_eq!(table.columns(), ["presence", "habitat", "elevation", "slope"]);
        assert_eq!(
            table.levels("habitat").unwrap(),
            ["forest".to_string(), "wetland".to_string()]
        );
        // Row 0 is a wetland, row 1 a forest.
        assert_abs_diff_eq!(table.column("habitat").unwrap()[0], 1.0);
        assert_abs_diff_eq!(table.column("habitat").unwrap()[1], 0.0);
        assert_abs_diff_eq!(table.column("elevation").unwrap()[11], 111.0, epsilon = 1e-9);
        assert_abs_diff_eq!(table.column("slope").unwrap()[5], 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_text_column_without_factor_declaration_is_rejected() {
        let file = create_test_file(&sample_content(12)).unwrap();
        match load_table(file.path(), &LoadOptions::default()) {
            Err(DataError::ColumnWrongType { column_name, .. }) => {
                assert_eq!(column_name, "habitat")
            }
            other => panic!("Expected ColumnWrongType(habitat), got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_factor_column_is_rejected() {
        let file = create_test_file(&sample_content(12)).unwrap();
        let options = LoadOptions {
            factors: vec!["habitat".to_string(), "soil".to_string()],
            ..LoadOptions::default()
        };
        match load_table(file.path(), &options) {
            Err(DataError::ColumnNotFound(col)) => assert_eq!(col, "soil"),
            other => panic!("Expected ColumnNotFound(soil), got {:?}", other),
        }
    }

    #[test]
    fn test_insufficient_rows() {
        let file = create_test_file(&sample_content(4)).unwrap();
        let options = LoadOptions {
            factors: vec!["habitat".to_string()],
            ..LoadOptions::default()
        };
        match load_table(file.path(), &options) {
            Err(DataError::InsufficientRows { found, required }) => {
                assert_eq!(found, 4);
                assert_eq!(required, 10);
            }
            other => panic!("Expected InsufficientRows, got {:?}", other),
        }
    }

    #[test]
    fn test_comma_separated_input() {
        let mut lines = vec!["y,x1,x2".to_string()];
        for i in 0..10 {
            lines.push(format!("{},{},{}", i % 2, i, i * 2));
        }
        let file = create_test_file(&lines.join("\n")).unwrap();
        let options = LoadOptions {
            separator: Separator::Comma,
            ..LoadOptions::default()
        };
        let table = load_table(file.path(), &options).unwrap();
        assert_eq!(table.ncols(), 3);
        assert_abs_diff_eq!(table.column("x2").unwrap()[9], 18.0);
    }

    #[test]
    fn test_layout_validation() {
        let layout = ColumnLayout {
            responses: 2,
            features: (3, 6),
        };
        assert!(layout.validate(6).is_ok());
        assert_eq!(layout.feature_positions(), vec![2, 3, 4, 5]);
        assert_eq!(layout.n_features(), 4);

        assert!(layout.validate(5).is_err());

        let overlapping = ColumnLayout {
            responses: 3,
            features: (3, 6),
        };
        assert!(matches!(
            overlapping.validate(6),
            Err(DataError::InvalidLayout(_))
        ));

        let no_responses = ColumnLayout {
            responses: 0,
            features: (1, 2),
        };
        assert!(no_responses.validate(2).is_err());
    }

    #[test]
    fn test_select_rows_and_columns_are_independent_copies() {
        let table = Table::new(
            vec!["a".into(), "b".into(), "c".into()],
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]],
        )
        .unwrap()
        .with_levels("b", vec!["lo".into(), "hi".into()])
        .unwrap();

        let rows = table.select_rows(&[2, 0]);
        assert_eq!(rows.values(), &array![[7.0, 8.0, 9.0], [1.0, 2.0, 3.0]]);

        let cols = table.select_columns(&[2, 1]);
        assert_eq!(cols.columns(), ["c", "b"]);
        assert!(cols.is_factor("b"));
        assert!(!cols.is_factor("a"));
        assert_eq!(cols.values(), &array![[3.0, 2.0], [6.0, 5.0], [9.0, 8.0]]);
    }

    #[test]
    fn test_duplicate_column_names_rejected() {
        let result = Table::new(vec!["a".into(), "a".into()], Array2::zeros((2, 2)));
        assert!(matches!(result, Err(DataError::DuplicateColumn(name)) if name == "a"));
    }
}
