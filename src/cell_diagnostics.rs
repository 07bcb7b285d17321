//! Cell-level XZ diagnostics.
//!
//! Builds the BAU/VUE/ADJ wide table for every audit cell, derives ratios,
//! distances, variances, area-channel weights and averages, then runs the four
//! threshold tests and labels each cell `Normal` or `Anomalous`.

use crate::config::Thresholds;
use crate::error::Result;
use crate::loader::{ADJ_XFACTOR, ADJ_XUNIVERSE};
use crate::ops::{self, fcol, flag_abs_above, flag_abs_at_least, relative_change, round_half_even, JoinReport};
use polars::prelude::*;
use tracing::info;

pub const CELL_ID: &str = "Cell_ID";
pub const CELL_NAME: &str = "Cell_Name";
pub const HANDLER: &str = "Handler";
pub const STORE_TYPE_CHANNEL: &str = "StoreTypeChannel";
pub const NIELSEN_AREA: &str = "NielsenArea";

pub const BAU_XFACTOR: &str = "BAU_XFactor";
pub const BAU_ZFACTOR: &str = "BAU_ZFactor";
pub const BAU_XZRATIO: &str = "BAU_XZRatio";
pub const VUE_XFACTOR: &str = "VUE_XFactor";
pub const VUE_ZFACTOR: &str = "VUE_ZFactor";
pub const VUE_XUNIVERSE: &str = "VUE_XUniverse";
pub const VUE_ZPANEL: &str = "VUE_ZPanel";
pub const VUE_XZRATIO: &str = "VUE_XZRatio";
pub const VUE_XZDISTANCE: &str = "VUE_XZDistance";
pub const XZ_PROPOSED_DISTANCE: &str = "XZ Proposed Distance";

pub const VAR_XUNIVERSE_BAU_VUE: &str = "VAR_XUniverse (BAU vs VUE)";
pub const VAR_XUNIVERSE_BAU_ADJ: &str = "VAR_XUniverse (BAU vs ADJ)";
pub const VAR_XFACTOR_BAU_VUE: &str = "VAR_XFactor (BAU vs VUE)";
pub const VAR_XFACTOR_BAU_ADJ: &str = "VAR_XFactor (BAU vs ADJ)";
pub const VAR_ZUNIVERSE: &str = "VAR_ZUniverse";

pub const DTEST: &str = "DTest";
pub const NSPC_TEST: &str = "NSPCTest";
pub const XF_TEST: &str = "XFTest";
pub const SIGN_TEST: &str = "SignTest";
pub const CELL_DIAGNOSTIC: &str = "CellDiagnostic";

pub const NORMAL: &str = "Normal";
pub const ANOMALOUS: &str = "Anomalous";

/// LastPeriod columns that never reach the wide table
const LAST_PERIOD_DROPPED: [&str; 2] = ["Period", "Condition"];

/// SampleNSPC columns used by the engine, in their raw spelling
const SAMPLE_NSPC_COLUMNS: [&str; 9] = [
    "IBD Name",
    "IBD ID",
    "Cell ID",
    "X Universe",
    "Z Universe",
    "X Panel",
    "Z Panel",
    "X Factor",
    "Z Factor",
];

/// SampleNSPC identity columns: spaces become underscores, no prefix
const SAMPLE_NSPC_IDENTITY: [&str; 3] = ["IBD Name", "IBD ID", "Cell ID"];

/// Cell names that mark a non-handling cell
const NON_HANDLER_PATTERNS: [&str; 4] = ["_NM", "_NO_MANEJANTE", "NOMANEJANTE", "NO MANEJANTE"];

/// (weight column, universe column it is computed from)
pub const AREA_CHANNEL_WEIGHTS: [(&str, &str); 5] = [
    ("BAU_N Area-Channel Cell Weight", "BAU_ZUniverse"),
    ("BAU_NSPC Area-Channel Cell Weight", "BAU_XUniverse"),
    ("VUE_N Area-Channel Cell Weight", "VUE_ZUniverse"),
    ("VUE_NSPC Area-Channel Cell Weight", "VUE_XUniverse"),
    ("ADJ_NSPC Area-Channel Cell Weight", "ADJ_XUniverse"),
];

/// (diff column, minuend weight, subtrahend weight)
const WEIGHT_DIFFS: [(&str, &str, &str); 4] = [
    (
        "N Area-Channel Cell Weight diff (BAU vs VUE)",
        "BAU_N Area-Channel Cell Weight",
        "VUE_N Area-Channel Cell Weight",
    ),
    (
        "NSPC Area-Channel Cell Weight diff (BAU vs VUE)",
        "BAU_NSPC Area-Channel Cell Weight",
        "VUE_NSPC Area-Channel Cell Weight",
    ),
    (
        "NSPC Area-Channel Cell Weight diff (BAU vs ADJ)",
        "BAU_NSPC Area-Channel Cell Weight",
        "ADJ_NSPC Area-Channel Cell Weight",
    ),
    (
        "NSPC Area-Channel Cell Weight diff (VUE vs ADJ)",
        "VUE_NSPC Area-Channel Cell Weight",
        "ADJ_NSPC Area-Channel Cell Weight",
    ),
];

/// (average column, X column, Z column). ADJ has no Z measurement of its own.
const AVERAGES: [(&str, &str, &str); 5] = [
    ("Average BAU Universe", "BAU_XUniverse", "BAU_ZUniverse"),
    ("Average BAU Panel", "BAU_XPanel", "BAU_ZPanel"),
    ("Average VUE Universe", "VUE_XUniverse", "VUE_ZUniverse"),
    ("Average VUE Panel", "VUE_XPanel", "VUE_ZPanel"),
    ("Average ADJ Universe", "ADJ_XUniverse", "VUE_ZUniverse"),
];

/// Column order of the merged BAU/VUE cell table
pub const VUE_CELL_COLUMNS: [&str; 26] = [
    "INDEX",
    "CHANNEL",
    "SAMPLE",
    "IBD_ID",
    "IBD_Name",
    CELL_ID,
    CELL_NAME,
    NIELSEN_AREA,
    STORE_TYPE_CHANNEL,
    "StoreType",
    HANDLER,
    "BAU_XPanel",
    "BAU_ZPanel",
    "BAU_XUniverse",
    "BAU_ZUniverse",
    BAU_XFACTOR,
    BAU_ZFACTOR,
    BAU_XZRATIO,
    VUE_XUNIVERSE,
    "VUE_ZUniverse",
    "VUE_XPanel",
    VUE_ZPANEL,
    VUE_XFACTOR,
    VUE_ZFACTOR,
    VUE_XZRATIO,
    VUE_XZDISTANCE,
];

/// The four tables the cell engine reads
#[derive(Debug, Clone, Copy)]
pub struct CellInputs<'a> {
    pub cells_chars: &'a DataFrame,
    pub cells_last_period: &'a DataFrame,
    pub vue_sample_nspc: &'a DataFrame,
    /// Hand-edited ADJ values keyed by Cell_ID
    pub adjustments: Option<&'a DataFrame>,
}

/// Final wide cell table plus the join accounting of the stages that built it
#[derive(Debug, Clone)]
pub struct CellDiagnostics {
    pub table: DataFrame,
    pub joins: Vec<JoinReport>,
}

impl CellDiagnostics {
    pub fn anomalous_count(&self) -> Result<usize> {
        count_label(&self.table, CELL_DIAGNOSTIC, ANOMALOUS)
    }
}

pub(crate) fn count_label(df: &DataFrame, column: &str, label: &str) -> Result<usize> {
    let values = df.column(column)?.str()?;
    Ok(values.into_iter().filter(|v| *v == Some(label)).count())
}

/// `"X Universe"` -> `"VUE_XUniverse"`, `"Cell ID"` -> `"Cell_ID"`
pub fn vue_column_name(raw: &str) -> String {
    if SAMPLE_NSPC_IDENTITY.contains(&raw) {
        raw.replace(' ', "_")
    } else {
        format!("VUE_{}", raw.replace(' ', ""))
    }
}

pub struct CellDiagnosticsEngine;

impl CellDiagnosticsEngine {
    /// Run every cell stage in order and return the XZ template table
    pub fn run(&self, inputs: CellInputs<'_>, thresholds: &Thresholds) -> Result<CellDiagnostics> {
        let (bau, bau_join) = self.build_bau_cells(inputs.cells_chars, inputs.cells_last_period)?;
        let (vue, vue_join) = self.build_vue_cells(&bau, inputs.vue_sample_nspc)?;
        let cells = self.compute_variance_metrics(vue, inputs.adjustments)?;
        let cells = self.compute_area_channel_weights(cells)?;
        let cells = self.compute_weight_diffs(cells)?;
        let cells = self.compute_averages(cells)?;
        let cells = self.apply_tests(cells, thresholds)?;
        let table = self.diagnose(cells)?;

        let result = CellDiagnostics {
            table,
            joins: vec![bau_join, vue_join],
        };
        info!(
            "Cell diagnostics: {} cells, {} anomalous",
            result.table.height(),
            result.anomalous_count()?
        );
        Ok(result)
    }

    /// Prefix LastPeriod measurements with `BAU_`, attach cell characteristics
    /// and compute the unrounded BAU X/Z ratio.
    pub fn build_bau_cells(
        &self,
        cells_chars: &DataFrame,
        cells_last_period: &DataFrame,
    ) -> Result<(DataFrame, JoinReport)> {
        let renamed: Vec<Expr> = cells_last_period
            .get_column_names()
            .into_iter()
            .filter(|c| !LAST_PERIOD_DROPPED.contains(c))
            .map(|c| {
                if c == CELL_ID || c == CELL_NAME {
                    col(c)
                } else {
                    col(c).alias(&format!("BAU_{}", c))
                }
            })
            .collect();
        let last_period = cells_last_period.clone().lazy().select(renamed).collect()?;

        let (joined, report) = ops::inner_join("bau_cells", cells_chars, &last_period, &[CELL_ID])?;

        let cells = joined
            .lazy()
            .with_columns([(fcol(BAU_XFACTOR) / fcol(BAU_ZFACTOR)).alias(BAU_XZRATIO)])
            .collect()?;
        Ok((cells, report))
    }

    /// Attach the VUE sample measurements, derive the VUE ratio, distance and
    /// handler flag, and fix the column order.
    pub fn build_vue_cells(
        &self,
        bau_cells: &DataFrame,
        vue_sample_nspc: &DataFrame,
    ) -> Result<(DataFrame, JoinReport)> {
        let renamed: Vec<Expr> = SAMPLE_NSPC_COLUMNS
            .iter()
            .map(|&c| col(c).alias(&vue_column_name(c)))
            .collect();
        let vue = vue_sample_nspc.clone().lazy().select(renamed).collect()?;

        let (joined, report) = ops::inner_join("vue_cells", bau_cells, &vue, &[CELL_ID])?;

        let non_handler = NON_HANDLER_PATTERNS
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");

        let cells = joined
            .lazy()
            .with_columns([
                round_half_even(fcol(VUE_XFACTOR) / fcol(VUE_ZFACTOR), 4).alias(VUE_XZRATIO),
                round_half_even(
                    (lit(1.0) - fcol(VUE_ZFACTOR) / fcol(VUE_XFACTOR)) * fcol(VUE_ZPANEL).sqrt(),
                    4,
                )
                .alias(VUE_XZDISTANCE),
                when(col(CELL_NAME).str().contains(lit(non_handler), true))
                    .then(lit(0i32))
                    .otherwise(lit(1i32))
                    .alias(HANDLER),
            ])
            .collect()?;

        Ok((ops::select_columns(cells, &VUE_CELL_COLUMNS)?, report))
    }

    /// Seed the ADJ set from VUE (or from explicit overrides) and compute the
    /// five relative-change variance columns.
    pub fn compute_variance_metrics(&self, cells: DataFrame, adjustments: Option<&DataFrame>) -> Result<DataFrame> {
        let cells = cells
            .lazy()
            .with_columns([col(VUE_XZDISTANCE).alias(XZ_PROPOSED_DISTANCE)])
            .collect()?;
        let cells = match adjustments {
            None => cells
                .lazy()
                .with_columns([col(VUE_XFACTOR).alias(ADJ_XFACTOR), col(VUE_XUNIVERSE).alias(ADJ_XUNIVERSE)])
                .collect()?,
            Some(overrides) => apply_adjustments(cells, overrides)?,
        };

        let out = cells
            .lazy()
            .with_columns([
                relative_change(fcol("BAU_XUniverse"), fcol(VUE_XUNIVERSE)).alias(VAR_XUNIVERSE_BAU_VUE),
                relative_change(fcol("BAU_XUniverse"), fcol(ADJ_XUNIVERSE)).alias(VAR_XUNIVERSE_BAU_ADJ),
                relative_change(fcol(BAU_XFACTOR), fcol(VUE_XFACTOR)).alias(VAR_XFACTOR_BAU_VUE),
                relative_change(fcol(BAU_XFACTOR), fcol(ADJ_XFACTOR)).alias(VAR_XFACTOR_BAU_ADJ),
                relative_change(fcol("BAU_ZUniverse"), fcol("VUE_ZUniverse")).alias(VAR_ZUNIVERSE),
            ])
            .collect()?;
        Ok(out)
    }

    /// Each handling cell's share of its (StoreTypeChannel, NielsenArea)
    /// universe, for five universe columns. Non-handling cells and empty
    /// groups get 0.
    pub fn compute_area_channel_weights(&self, cells: DataFrame) -> Result<DataFrame> {
        let handles = || col(HANDLER).eq(lit(1i32));
        let group_sum = |weight: &str| format!("__group_sum {}", weight);

        let sums = cells
            .clone()
            .lazy()
            .group_by([col(STORE_TYPE_CHANNEL), col(NIELSEN_AREA)])
            .agg(
                AREA_CHANNEL_WEIGHTS
                    .iter()
                    .map(|&(weight, source)| {
                        when(handles())
                            .then(fcol(source))
                            .otherwise(lit(0.0))
                            .sum()
                            .alias(&group_sum(weight))
                    })
                    .collect::<Vec<_>>(),
            )
            .collect()?;

        let joined = ops::left_join(&cells, &sums, &[STORE_TYPE_CHANNEL, NIELSEN_AREA])?;

        let weights: Vec<Expr> = AREA_CHANNEL_WEIGHTS
            .iter()
            .map(|&(weight, source)| {
                let total = col(&group_sum(weight));
                when(handles().and(total.clone().neq(lit(0.0))))
                    .then(fcol(source) / total)
                    .otherwise(lit(0.0))
                    .alias(weight)
            })
            .collect();
        let helpers: Vec<String> = AREA_CHANNEL_WEIGHTS.iter().map(|&(w, _)| group_sum(w)).collect();

        Ok(joined.lazy().with_columns(weights).drop(helpers).collect()?)
    }

    pub fn compute_weight_diffs(&self, cells: DataFrame) -> Result<DataFrame> {
        let diffs: Vec<Expr> = WEIGHT_DIFFS
            .iter()
            .map(|&(name, left, right)| (col(left) - col(right)).alias(name))
            .collect();
        Ok(cells.lazy().with_columns(diffs).collect()?)
    }

    pub fn compute_averages(&self, cells: DataFrame) -> Result<DataFrame> {
        let averages: Vec<Expr> = AVERAGES
            .iter()
            .map(|&(name, x, z)| round_half_even(fcol(x) / fcol(z), 3).alias(name))
            .collect();
        Ok(cells.lazy().with_columns(averages).collect()?)
    }

    /// Distance, NSPC, X-factor and sign tests; 1 marks a failure
    pub fn apply_tests(&self, cells: DataFrame, thresholds: &Thresholds) -> Result<DataFrame> {
        Ok(cells
            .lazy()
            .with_columns([
                flag_abs_above(col(VUE_XZDISTANCE), thresholds.distance).alias(DTEST),
                flag_abs_at_least(col(VAR_XUNIVERSE_BAU_ADJ), thresholds.nspc).alias(NSPC_TEST),
                flag_abs_at_least(col(VAR_XFACTOR_BAU_ADJ), thresholds.xf).alias(XF_TEST),
                sign_test(col(VAR_XUNIVERSE_BAU_ADJ), col(VAR_ZUNIVERSE)).alias(SIGN_TEST),
            ])
            .collect()?)
    }

    /// Two or more failed tests make a cell anomalous
    pub fn diagnose(&self, cells: DataFrame) -> Result<DataFrame> {
        let failures = col(DTEST) + col(NSPC_TEST) + col(XF_TEST) + col(SIGN_TEST);
        Ok(cells
            .lazy()
            .with_columns([when(failures.gt_eq(lit(2i32)))
                .then(lit(ANOMALOUS))
                .otherwise(lit(NORMAL))
                .alias(CELL_DIAGNOSTIC)])
            .collect()?)
    }
}

/// 0 when the two variances move in the same direction.
///
/// With a nonzero `z` the signs agree iff `x / z > 0`. A zero `z` only agrees
/// with a zero `x`.
pub fn sign_test(x: Expr, z: Expr) -> Expr {
    let ratio = x.clone() / z.clone();
    let same_sign = ratio.clone().is_not_nan().and(ratio.gt(lit(0.0)));
    when(z.neq(lit(0.0)))
        .then(when(same_sign).then(lit(0i32)).otherwise(lit(1i32)))
        .otherwise(when(x.eq(lit(0.0))).then(lit(0i32)).otherwise(lit(1i32)))
}

/// Replace the VUE copy of the ADJ columns with hand-edited values where a
/// cell has one. Blank override cells keep the VUE value.
fn apply_adjustments(cells: DataFrame, overrides: &DataFrame) -> Result<DataFrame> {
    let override_name = |c: &str| format!("__override {}", c);
    let present: Vec<&str> = [ADJ_XFACTOR, ADJ_XUNIVERSE]
        .into_iter()
        .filter(|c| overrides.column(c).is_ok())
        .collect();

    let mut selected = vec![col(CELL_ID)];
    selected.extend(present.iter().map(|&c| fcol(c).alias(&override_name(c))));
    let overrides = overrides
        .clone()
        .lazy()
        .select(selected)
        .unique_stable(Some(vec![CELL_ID.to_string()]), UniqueKeepStrategy::Last)
        .collect()?;

    let joined = ops::left_join(&cells, &overrides, &[CELL_ID])?;

    // The ADJ column keeps the dtype of the VUE column it replaces
    let adjusted = |target: &str, source: &str| -> Result<Expr> {
        if present.contains(&target) {
            let dtype = joined.column(source)?.dtype().clone();
            let value = col(&override_name(target));
            Ok(when(value.clone().is_not_null().and(value.clone().is_not_nan()))
                .then(value.cast(dtype))
                .otherwise(col(source))
                .alias(target))
        } else {
            Ok(col(source).alias(target))
        }
    };
    let adjusted_columns = [adjusted(ADJ_XFACTOR, VUE_XFACTOR)?, adjusted(ADJ_XUNIVERSE, VUE_XUNIVERSE)?];
    let helpers: Vec<String> = present.iter().map(|&c| override_name(c)).collect();

    let out = joined
        .lazy()
        .with_columns(adjusted_columns)
        .drop(helpers)
        .collect()?;
    info!("Applied ADJ overrides for {} cells", overrides.height());
    Ok(out)
}
