//! End-to-end run: load inputs, run the cell stage and the impact stage,
//! write each stage's artifact as soon as it exists and finish with a JSON
//! run summary.

use crate::cell_diagnostics::{CellDiagnosticsEngine, CellInputs};
use crate::config::{RunConfig, Thresholds};
use crate::error::Result;
use crate::impact_diagnostics::{ImpactArtifact, ImpactDiagnosticsEngine, ImpactInputs};
use crate::loader::{self, InputLoader};
use crate::ops::JoinReport;
use crate::schema;
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct OutputSummary {
    pub file: String,
    pub rows: usize,
    pub columns: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub thresholds: Thresholds,
    pub adjustments: Option<PathBuf>,
    pub outputs: Vec<OutputSummary>,
    pub joins: Vec<JoinReport>,
    pub anomalous_cells: usize,
    pub anomalous_cell_categories: usize,
}

impl RunSummary {
    pub fn dropped_rows(&self) -> usize {
        self.joins.iter().map(|j| j.dropped_rows()).sum()
    }
}

pub struct DiagnosticsPipeline {
    config: RunConfig,
}

impl DiagnosticsPipeline {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn run(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let thresholds = self.config.thresholds;
        thresholds.validate()?;
        info!("Run {} started in {}", run_id, self.config.working_dir.display());

        let inputs = InputLoader::new(self.config.inputs_dir()).load_all()?;
        let adjustments = match &self.config.adjustments {
            Some(path) => Some(loader::load_adjustments(path)?),
            None => None,
        };

        let outputs_dir = self.config.outputs_dir();
        std::fs::create_dir_all(&outputs_dir)?;
        let mut outputs = Vec::new();

        let cells = CellDiagnosticsEngine.run(
            CellInputs {
                cells_chars: &inputs.cells_chars,
                cells_last_period: &inputs.cells_last_period,
                vue_sample_nspc: &inputs.vue_sample_nspc,
                adjustments: adjustments.as_ref(),
            },
            &thresholds,
        )?;
        let mut cell_table = cells.table.clone();
        outputs.push(write_output(&outputs_dir, schema::XZ_TEMPLATE_OUTPUT, &mut cell_table)?);

        let impacts = ImpactDiagnosticsEngine.run(
            ImpactInputs {
                cells: &cells.table,
                vue_impacts: &inputs.vue_impacts,
                mbd_num_dist: &inputs.mbd_num_dist,
                mbd_type_target: &inputs.mbd_type_target,
            },
            &thresholds,
            |artifact, df| {
                let file_name = match artifact {
                    ImpactArtifact::BrandImpacts => schema::MBD_CAT_IMPACTS_OUTPUT,
                    ImpactArtifact::Diagnostics => schema::MBD_CAT_CELL_IMPACTS_OUTPUT,
                };
                outputs.push(write_output(&outputs_dir, file_name, df)?);
                Ok(())
            },
        )?;

        let anomalous_cells = cells.anomalous_count()?;
        let anomalous_cell_categories = impacts.anomalous_count()?;

        let mut joins = cells.joins;
        joins.extend(impacts.joins);

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            thresholds,
            adjustments: self.config.adjustments.clone(),
            outputs,
            joins,
            anomalous_cells,
            anomalous_cell_categories,
        };

        let summary_path = outputs_dir.join(schema::RUN_SUMMARY_OUTPUT);
        std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;
        info!(
            "Run {} finished: {} anomalous cells, {} anomalous cell-category rows, {} rows dropped by joins",
            summary.run_id,
            summary.anomalous_cells,
            summary.anomalous_cell_categories,
            summary.dropped_rows()
        );
        Ok(summary)
    }
}

/// Write `df` as a headed CSV without a row-index column
fn write_output(dir: &Path, file_name: &str, df: &mut DataFrame) -> Result<OutputSummary> {
    let path = dir.join(file_name);
    let mut file = File::create(&path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b',')
        .finish(df)?;
    info!("Wrote {} ({} rows)", path.display(), df.height());
    Ok(OutputSummary {
        file: file_name.to_string(),
        rows: df.height(),
        columns: df.width(),
    })
}
