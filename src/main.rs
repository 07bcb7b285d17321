use anyhow::{Context, Result};
use audit_diagnostics::{DiagnosticsPipeline, InputLoader, RunConfig, Thresholds};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "audit-diagnostics")]
#[command(about = "Cell adjustment and brand/category impact diagnostics for retail audit panels")]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run both diagnostic stages and write the outputs
    Run(RunArgs),
    /// Check input file names, headers and value types only
    Validate {
        /// Directory holding inputs/ (default: current directory)
        #[arg(short, long, default_value = ".")]
        working_dir: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Directory holding inputs/ and receiving outputs/
    #[arg(short, long, default_value = ".")]
    working_dir: PathBuf,

    /// JSON file with distance, nspc, xf, cell_cat and cell_weight
    #[arg(long)]
    params: Option<PathBuf>,

    /// Maximum |VUE_XZDistance| for DTest
    #[arg(long)]
    distance: Option<f64>,

    /// NSPCTest threshold on the X universe change
    #[arg(long)]
    nspc: Option<f64>,

    /// XFTest threshold on the X factor change
    #[arg(long)]
    xf: Option<f64>,

    /// Minimum |ADJ_SalesImpact| for a relevant cell-category
    #[arg(long)]
    cell_cat: Option<f64>,

    /// Minimum Baseline_CellImportance for a relevant cell-category
    #[arg(long)]
    cell_weight: Option<f64>,

    /// CSV of hand-edited ADJ_XFactor / ADJ_XUniverse values keyed by Cell_ID
    #[arg(long)]
    adjustments: Option<PathBuf>,
}

impl RunArgs {
    /// Parameters file first, then individual flags on top
    fn thresholds(&self) -> Result<Thresholds> {
        let mut thresholds = match &self.params {
            Some(path) => Thresholds::load(path)
                .with_context(|| format!("Failed to load parameters from {}", path.display()))?,
            None => Thresholds::default(),
        };
        if let Some(v) = self.distance {
            thresholds.distance = v;
        }
        if let Some(v) = self.nspc {
            thresholds.nspc = v;
        }
        if let Some(v) = self.xf {
            thresholds.xf = v;
        }
        if let Some(v) = self.cell_cat {
            thresholds.cell_cat = v;
        }
        if let Some(v) = self.cell_weight {
            thresholds.cell_weight = v;
        }
        thresholds.validate()?;
        Ok(thresholds)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let outcome = match cli.command {
        Command::Run(args) => run(args),
        Command::Validate { working_dir } => validate(working_dir),
    };
    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}

fn run(args: RunArgs) -> Result<()> {
    let thresholds = args.thresholds()?;
    info!("Thresholds: {:?}", thresholds);

    let config = RunConfig::new(&args.working_dir, thresholds).with_adjustments(args.adjustments);
    let summary = DiagnosticsPipeline::new(config)
        .run()
        .context("Diagnostics run failed")?;

    println!("\n=== Diagnostics Results ===");
    println!("Run: {}", summary.run_id);
    for output in &summary.outputs {
        println!("  {:<28} {:>8} rows  {:>3} columns", output.file, output.rows, output.columns);
    }
    println!("Anomalous cells: {}", summary.anomalous_cells);
    println!("Anomalous cell-category rows: {}", summary.anomalous_cell_categories);
    if summary.dropped_rows() > 0 {
        println!("Rows dropped by joins: {}", summary.dropped_rows());
    }
    Ok(())
}

fn validate(working_dir: PathBuf) -> Result<()> {
    let config = RunConfig::new(working_dir, Thresholds::default());
    let summaries = InputLoader::new(config.inputs_dir())
        .validate()
        .context("Input validation failed")?;

    println!("\n=== Input Validation ===");
    for summary in &summaries {
        println!("  {:<24} {:>8} rows  {:>3} columns", summary.file, summary.rows, summary.columns.len());
    }
    println!("{} files valid", summaries.len());
    Ok(())
}
