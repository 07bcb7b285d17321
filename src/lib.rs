pub mod cell_diagnostics;
pub mod config;
pub mod error;
pub mod impact_diagnostics;
pub mod loader;
pub mod ops;
pub mod pipeline;
pub mod schema;

pub use cell_diagnostics::{CellDiagnostics, CellDiagnosticsEngine, CellInputs};
pub use config::{RunConfig, Thresholds};
pub use error::{DiagnosticsError, Result};
pub use impact_diagnostics::{ImpactDiagnostics, ImpactDiagnosticsEngine, ImpactInputs};
pub use loader::{InputLoader, InputTables};
pub use ops::JoinReport;
pub use pipeline::{DiagnosticsPipeline, RunSummary};
