use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error(
        "Schema error in {file}: unexpected columns [{}]; expected a subset of [{}]",
        unexpected.join(", "),
        expected.join(", ")
    )]
    Schema {
        file: String,
        unexpected: Vec<String>,
        expected: Vec<String>,
    },

    #[error(
        "Unexpected input files [{}] (closest names: [{}]); expected file names are [{}]",
        names.join(", "),
        suggestions.join(", "),
        expected.join(", ")
    )]
    UnknownInputFile {
        names: Vec<String>,
        suggestions: Vec<String>,
        expected: Vec<String>,
    },

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Cannot coerce {file} row {row} column '{column}' value '{value}' to {expected}")]
    Coercion {
        file: String,
        column: String,
        row: usize,
        value: String,
        expected: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::error::PolarsError> for DiagnosticsError {
    fn from(err: polars::error::PolarsError) -> Self {
        DiagnosticsError::Polars(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiagnosticsError>;
