//! Input loading: file name and header validation, type coercion and text
//! normalisation. Hands schema-conformant `DataFrame`s to the engines.

use crate::error::{DiagnosticsError, Result};
use crate::schema::{self, ColumnKind};
use csv::ReaderBuilder;
use polars::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use strsim::jaro_winkler;
use tracing::{debug, info};

pub const ADJ_XFACTOR: &str = "ADJ_XFactor";
pub const ADJ_XUNIVERSE: &str = "ADJ_XUniverse";
const ADJUSTMENT_COLUMNS: [&str; 3] = ["Cell_ID", ADJ_XFACTOR, ADJ_XUNIVERSE];

/// The six validated input tables
#[derive(Debug, Clone)]
pub struct InputTables {
    pub cells_chars: DataFrame,
    pub cells_last_period: DataFrame,
    pub mbd_num_dist: DataFrame,
    pub mbd_type_target: DataFrame,
    pub vue_impacts: DataFrame,
    pub vue_sample_nspc: DataFrame,
}

/// Per-file outcome of a validation pass
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub file: String,
    pub rows: usize,
    pub columns: Vec<String>,
}

pub struct InputLoader {
    inputs_dir: PathBuf,
}

impl InputLoader {
    pub fn new(inputs_dir: impl Into<PathBuf>) -> Self {
        Self {
            inputs_dir: inputs_dir.into(),
        }
    }

    /// List the CSV files in the inputs directory, failing on any name that is
    /// not part of the input contract.
    pub fn validate_file_names(&self) -> Result<Vec<String>> {
        if !self.inputs_dir.is_dir() {
            return Err(DiagnosticsError::MissingInput(format!(
                "inputs directory not found: {}",
                self.inputs_dir.display()
            )));
        }

        let mut csv_files = Vec::new();
        for entry in std::fs::read_dir(&self.inputs_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".csv") {
                csv_files.push(name);
            }
        }
        csv_files.sort();

        let unknown: Vec<String> = csv_files
            .iter()
            .filter(|name| !schema::is_input_file(name))
            .cloned()
            .collect();

        if !unknown.is_empty() {
            let suggestions = unknown.iter().map(|name| closest_input_name(name)).collect();
            return Err(DiagnosticsError::UnknownInputFile {
                names: unknown,
                suggestions,
                expected: schema::INPUT_FILES.iter().map(|s| s.to_string()).collect(),
            });
        }

        Ok(csv_files)
    }

    /// Validate every present input file without handing tables to the engines
    pub fn validate(&self) -> Result<Vec<FileSummary>> {
        let files = self.validate_file_names()?;
        let mut summaries = Vec::with_capacity(files.len());
        for file in files {
            let df = self.load_table(&file)?;
            summaries.push(FileSummary {
                file,
                rows: df.height(),
                columns: df.get_column_names().iter().map(|c| c.to_string()).collect(),
            });
        }
        Ok(summaries)
    }

    pub fn load_all(&self) -> Result<InputTables> {
        let present = self.validate_file_names()?;
        let missing: Vec<&str> = schema::INPUT_FILES
            .iter()
            .copied()
            .filter(|f| !present.iter().any(|p| p == f))
            .collect();
        if !missing.is_empty() {
            return Err(DiagnosticsError::MissingInput(format!(
                "required input files not found in {}: {}",
                self.inputs_dir.display(),
                missing.join(", ")
            )));
        }

        Ok(InputTables {
            cells_chars: self.load_table(schema::CELLS_CHARS)?,
            cells_last_period: self.load_table(schema::CELLS_LAST_PERIOD)?,
            mbd_num_dist: self.load_table(schema::MBD_NUM_DIST)?,
            mbd_type_target: self.load_table(schema::MBD_TYPE_TARGET)?,
            vue_impacts: self.load_table(schema::VUE_IMPACTS)?,
            vue_sample_nspc: self.load_table(schema::VUE_SAMPLE_NSPC)?,
        })
    }

    /// Load one input file by its contract name
    pub fn load_table(&self, file_name: &str) -> Result<DataFrame> {
        let declared = schema::declared_columns(file_name).ok_or_else(|| {
            DiagnosticsError::UnknownInputFile {
                names: vec![file_name.to_string()],
                suggestions: vec![closest_input_name(file_name)],
                expected: schema::INPUT_FILES.iter().map(|s| s.to_string()).collect(),
            }
        })?;
        let path = self.inputs_dir.join(file_name);
        let df = read_typed_csv(&path, file_name, declared, schema::column_kind)?;
        info!("Loaded {} ({} rows, {} columns)", file_name, df.height(), df.width());
        Ok(df)
    }
}

/// Load the optional table of hand-edited ADJ values.
///
/// `Cell_ID` is required; `ADJ_XFactor` and `ADJ_XUniverse` are each optional.
pub fn load_adjustments(path: &Path) -> Result<DataFrame> {
    let display = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let df = read_typed_csv(path, &display, &ADJUSTMENT_COLUMNS, |column| match column {
        "Cell_ID" => ColumnKind::Int,
        _ => ColumnKind::Float,
    })?;
    if df.column("Cell_ID").is_err() {
        return Err(DiagnosticsError::Schema {
            file: display,
            unexpected: vec![],
            expected: ADJUSTMENT_COLUMNS.iter().map(|s| s.to_string()).collect(),
        });
    }
    info!("Loaded ADJ overrides from {} ({} rows)", path.display(), df.height());
    Ok(df)
}

fn closest_input_name(name: &str) -> String {
    schema::INPUT_FILES
        .iter()
        .map(|candidate| (candidate, jaro_winkler(name, candidate)))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(candidate, _)| candidate.to_string())
        .unwrap_or_default()
}

enum ColumnBuffer {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Text(Vec<String>),
}

impl ColumnBuffer {
    fn new(kind: ColumnKind) -> Self {
        match kind {
            ColumnKind::Int => ColumnBuffer::Int(Vec::new()),
            ColumnKind::Float => ColumnBuffer::Float(Vec::new()),
            ColumnKind::Text => ColumnBuffer::Text(Vec::new()),
        }
    }

    fn into_series(self, name: &str) -> Series {
        match self {
            ColumnBuffer::Int(values) => Series::new(name, values),
            ColumnBuffer::Float(values) => Series::new(name, values),
            ColumnBuffer::Text(values) => Series::new(name, values),
        }
    }
}

/// Read a CSV, reject undeclared columns and coerce every column to its
/// declared kind.
fn read_typed_csv(
    path: &Path,
    file_name: &str,
    declared: &[&str],
    kind_of: impl Fn(&str) -> ColumnKind,
) -> Result<DataFrame> {
    if !path.is_file() {
        return Err(DiagnosticsError::MissingInput(format!(
            "file not found: {}",
            path.display()
        )));
    }

    let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.to_string()).collect();

    let unexpected: Vec<String> = headers
        .iter()
        .filter(|h| !declared.contains(&h.as_str()))
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        return Err(DiagnosticsError::Schema {
            file: file_name.to_string(),
            unexpected,
            expected: declared.iter().map(|s| s.to_string()).collect(),
        });
    }

    let kinds: Vec<ColumnKind> = headers.iter().map(|h| kind_of(h)).collect();
    let mut buffers: Vec<ColumnBuffer> = kinds.iter().map(|k| ColumnBuffer::new(*k)).collect();

    for (row_idx, record) in rdr.records().enumerate() {
        let record = record?;
        for (col_idx, header) in headers.iter().enumerate() {
            let raw = record.get(col_idx).unwrap_or("");
            let coercion_error = |expected: ColumnKind| DiagnosticsError::Coercion {
                file: file_name.to_string(),
                column: header.clone(),
                // 1-based data row, header excluded
                row: row_idx + 1,
                value: raw.to_string(),
                expected: expected.label().to_string(),
            };
            match &mut buffers[col_idx] {
                ColumnBuffer::Int(values) => {
                    let value = parse_int(raw).ok_or_else(|| coercion_error(ColumnKind::Int))?;
                    values.push(value);
                }
                ColumnBuffer::Float(values) => {
                    let value = parse_float(raw).ok_or_else(|| coercion_error(ColumnKind::Float))?;
                    values.push(value);
                }
                ColumnBuffer::Text(values) => {
                    values.push(normalize_text(header, raw));
                }
            }
        }
    }

    let columns: Vec<Series> = buffers
        .into_iter()
        .zip(headers.iter())
        .map(|(buffer, name)| buffer.into_series(name))
        .collect();
    let df = DataFrame::new(columns)?;
    debug!("{}: coerced columns {:?}", file_name, df.get_column_names());
    Ok(df)
}

/// Integers accept float notation and truncate toward zero; blanks are rejected
fn parse_int(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Some(value.trunc() as i64),
        _ => None,
    }
}

/// Blank floats load as NaN
fn parse_float(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Some(f64::NAN);
    }
    trimmed.parse::<f64>().ok()
}

/// Transliterate to ASCII: `"Ñandú"` -> `"Nandu"`, `"Straße"` -> `"Strasse"`.
/// An empty cell stays empty.
fn normalize_text(column: &str, raw: &str) -> String {
    let ascii = deunicode::deunicode(raw);
    if column == schema::MBD_ID {
        mbd_code_suffix(&ascii).to_string()
    } else {
        ascii
    }
}

/// `"PRJ_07_1234"` becomes `"1234"`
pub fn mbd_code_suffix(code: &str) -> &str {
    code.rsplit_once('_').map(|(_, suffix)| suffix).unwrap_or(code)
}
