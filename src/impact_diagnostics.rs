//! Brand/category sales impact diagnostics.
//!
//! Projects every cell-category baseline through the BAU, VUE and ADJ
//! X-factors, aggregates the projections to brand×category, compares the
//! aggregate impact to the brand's target and combines both granularities
//! into the final diagnostic table.

use crate::cell_diagnostics::{count_label, ANOMALOUS, BAU_XFACTOR, CELL_ID, NORMAL, VUE_XFACTOR};
use crate::config::Thresholds;
use crate::error::Result;
use crate::loader::ADJ_XFACTOR;
use crate::ops::{self, fcol, ge_ieee, relative_change, round_half_even, JoinReport};
use polars::prelude::*;
use tracing::info;

pub const MBD_ID: &str = "MbdID";
pub const MBD_NAME: &str = "MbdName";
pub const CATEGORY_CODE: &str = "CategoryCode";
pub const CATEGORY_NAME: &str = "CategoryName";
pub const BASELINE_SALES: &str = "Baseline_Sales";
pub const BASELINE_CELL_IMPORTANCE: &str = "Baseline_CellImportance";
pub const UNPROJECTED_SALES: &str = "UnprojectedSales";
pub const VUE_PROJECTED_SALES: &str = "VUE_ProjectedSales";
pub const ADJ_PROJECTED_SALES: &str = "ADJ_ProjectedSales";
pub const VUE_SALES_IMPACT: &str = "VUE_SalesImpact";
pub const ADJ_SALES_IMPACT: &str = "ADJ_SalesImpact";
pub const CELL_CAT_TEST: &str = "CellCatTest";
pub const NUMERICAL_DISTRIBUTION: &str = "Numerical Distribution";
pub const MBD_TYPE: &str = "MBD Type";
pub const TARGET: &str = "Target";
pub const OUT_OF_TARGET: &str = "OutOfTarget";
pub const MBD_CAT_DIAG: &str = "MBDCatDiag";

const IMPACT_COLUMNS: [&str; 7] = [
    MBD_ID,
    MBD_NAME,
    CELL_ID,
    CATEGORY_CODE,
    CATEGORY_NAME,
    BASELINE_SALES,
    BASELINE_CELL_IMPORTANCE,
];

const CELL_FACTOR_COLUMNS: [&str; 4] = [CELL_ID, BAU_XFACTOR, VUE_XFACTOR, ADJ_XFACTOR];

const MBD_GROUP_COLUMNS: [&str; 4] = [MBD_ID, MBD_NAME, CATEGORY_CODE, CATEGORY_NAME];

const SUMMED_SALES: [&str; 3] = [BASELINE_SALES, VUE_PROJECTED_SALES, ADJ_PROJECTED_SALES];

const NUM_DIST_COLUMNS: [&str; 3] = [MBD_ID, CATEGORY_NAME, NUMERICAL_DISTRIBUTION];

const TYPE_TARGET_COLUMNS: [&str; 3] = [MBD_ID, MBD_TYPE, TARGET];

/// Brand-level columns carried onto every cell-category row
const BRAND_DIAGNOSTIC_COLUMNS: [&str; 6] = [
    MBD_ID,
    CATEGORY_NAME,
    MBD_TYPE,
    TARGET,
    OUT_OF_TARGET,
    NUMERICAL_DISTRIBUTION,
];

pub const DIAGNOSTIC_COLUMNS: [&str; 21] = [
    MBD_ID,
    MBD_NAME,
    CELL_ID,
    CATEGORY_CODE,
    CATEGORY_NAME,
    MBD_TYPE,
    TARGET,
    NUMERICAL_DISTRIBUTION,
    BASELINE_SALES,
    BASELINE_CELL_IMPORTANCE,
    BAU_XFACTOR,
    VUE_XFACTOR,
    ADJ_XFACTOR,
    UNPROJECTED_SALES,
    VUE_PROJECTED_SALES,
    ADJ_PROJECTED_SALES,
    VUE_SALES_IMPACT,
    ADJ_SALES_IMPACT,
    CELL_CAT_TEST,
    OUT_OF_TARGET,
    MBD_CAT_DIAG,
];

#[derive(Debug, Clone, Copy)]
pub struct ImpactInputs<'a> {
    /// Cell diagnostics table; only Cell_ID and the three X-factors are read
    pub cells: &'a DataFrame,
    pub vue_impacts: &'a DataFrame,
    pub mbd_num_dist: &'a DataFrame,
    pub mbd_type_target: &'a DataFrame,
}

/// Artifacts the impact stages hand out as soon as each one is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpactArtifact {
    BrandImpacts,
    Diagnostics,
}

#[derive(Debug, Clone)]
pub struct ImpactDiagnostics {
    pub cell_impacts: DataFrame,
    /// Brand×category impacts with distribution, target and OutOfTarget
    pub brand_impacts: DataFrame,
    /// Final per-cell, per-brand diagnostic table
    pub diagnostics: DataFrame,
    pub joins: Vec<JoinReport>,
}

impl ImpactDiagnostics {
    pub fn anomalous_count(&self) -> Result<usize> {
        count_label(&self.diagnostics, MBD_CAT_DIAG, ANOMALOUS)
    }
}

pub struct ImpactDiagnosticsEngine;

impl ImpactDiagnosticsEngine {
    /// Run every impact stage in order.
    ///
    /// `on_artifact` receives the brand table and then the final table as
    /// each is produced; an error from it stops the run before later stages.
    pub fn run<F>(&self, inputs: ImpactInputs<'_>, thresholds: &Thresholds, mut on_artifact: F) -> Result<ImpactDiagnostics>
    where
        F: FnMut(ImpactArtifact, &mut DataFrame) -> Result<()>,
    {
        let (cell_impacts, cell_join) = self.compute_cell_impacts(inputs.cells, inputs.vue_impacts, thresholds)?;
        let (mut brand_impacts, mut brand_joins) =
            self.compute_brand_impacts(&cell_impacts, inputs.mbd_num_dist, inputs.mbd_type_target)?;
        on_artifact(ImpactArtifact::BrandImpacts, &mut brand_impacts)?;

        let (mut diagnostics, diag_join) = self.get_diagnostics(&cell_impacts, &brand_impacts)?;
        on_artifact(ImpactArtifact::Diagnostics, &mut diagnostics)?;

        let mut joins = vec![cell_join];
        joins.append(&mut brand_joins);
        joins.push(diag_join);

        let result = ImpactDiagnostics {
            cell_impacts,
            brand_impacts,
            diagnostics,
            joins,
        };
        info!(
            "Impact diagnostics: {} cell-category rows, {} anomalous",
            result.diagnostics.height(),
            result.anomalous_count()?
        );
        Ok(result)
    }

    /// Aggregate to brand×category and attach distribution and target data.
    /// The result is the brand-level artifact.
    pub fn compute_brand_impacts(
        &self,
        cell_impacts: &DataFrame,
        mbd_num_dist: &DataFrame,
        mbd_type_target: &DataFrame,
    ) -> Result<(DataFrame, Vec<JoinReport>)> {
        let mbd = self.compute_mbd_impacts(cell_impacts)?;
        let (mbd, nd_join) = self.merge_num_dist(&mbd, mbd_num_dist)?;
        let (mbd, tt_join) = self.merge_type_target(&mbd, mbd_type_target)?;
        Ok((mbd, vec![nd_join, tt_join]))
    }

    /// Project each cell-category baseline through the cell X-factors.
    ///
    /// Every projected figure is rounded to cents before it feeds the next
    /// step; the impacts are relative changes against the baseline.
    pub fn compute_cell_impacts(
        &self,
        cells: &DataFrame,
        vue_impacts: &DataFrame,
        thresholds: &Thresholds,
    ) -> Result<(DataFrame, JoinReport)> {
        let impacts = ops::select_columns(vue_impacts.clone(), &IMPACT_COLUMNS)?;
        let factors = ops::select_columns(cells.clone(), &CELL_FACTOR_COLUMNS)?;

        let (joined, report) = ops::inner_join("cell_impacts", &impacts, &factors, &[CELL_ID])?;

        let relevant = ge_ieee(col(ADJ_SALES_IMPACT).abs(), lit(thresholds.cell_cat))
            .and(ge_ieee(col(BASELINE_CELL_IMPORTANCE), lit(thresholds.cell_weight)));

        let out = joined
            .lazy()
            .with_columns([round_half_even(fcol(BASELINE_SALES) / fcol(BAU_XFACTOR), 2).alias(UNPROJECTED_SALES)])
            .with_columns([
                round_half_even(col(UNPROJECTED_SALES) * fcol(VUE_XFACTOR), 2).alias(VUE_PROJECTED_SALES),
                round_half_even(col(UNPROJECTED_SALES) * fcol(ADJ_XFACTOR), 2).alias(ADJ_PROJECTED_SALES),
            ])
            .with_columns(sales_impacts())
            .with_columns([when(relevant).then(lit(1i32)).otherwise(lit(0i32)).alias(CELL_CAT_TEST)])
            .collect()?;
        Ok((out, report))
    }

    /// Sum sales per brand×category and re-derive the impacts from the sums.
    pub fn compute_mbd_impacts(&self, cell_impacts: &DataFrame) -> Result<DataFrame> {
        let group_by: Vec<Expr> = MBD_GROUP_COLUMNS.iter().map(|c| col(c)).collect();
        let sums: Vec<Expr> = SUMMED_SALES.iter().map(|c| col(c).sum()).collect();

        let out = cell_impacts
            .clone()
            .lazy()
            .group_by(group_by)
            .agg(sums)
            .sort(MBD_GROUP_COLUMNS, SortMultipleOptions::default())
            .with_columns(sales_impacts())
            .collect()?;
        info!("Aggregated {} cell-category rows into {} brand-category rows", cell_impacts.height(), out.height());
        Ok(out)
    }

    pub fn merge_num_dist(&self, mbd_impacts: &DataFrame, mbd_num_dist: &DataFrame) -> Result<(DataFrame, JoinReport)> {
        let num_dist = ops::select_columns(mbd_num_dist.clone(), &NUM_DIST_COLUMNS)?;
        ops::inner_join("mbd_num_dist", mbd_impacts, &num_dist, &[MBD_ID, CATEGORY_NAME])
    }

    /// Attach brand type and target; a brand is out of target when
    /// |ADJ_SalesImpact| reaches its target.
    pub fn merge_type_target(
        &self,
        mbd_impacts: &DataFrame,
        mbd_type_target: &DataFrame,
    ) -> Result<(DataFrame, JoinReport)> {
        let type_target = ops::select_columns(mbd_type_target.clone(), &TYPE_TARGET_COLUMNS)?;
        let (joined, report) = ops::inner_join("mbd_type_target", mbd_impacts, &type_target, &[MBD_ID])?;

        let flagged = joined
            .lazy()
            .with_columns([when(ge_ieee(col(ADJ_SALES_IMPACT).abs(), col(TARGET)))
                .then(lit(1i32))
                .otherwise(lit(0i32))
                .alias(OUT_OF_TARGET)])
            .collect()?;
        Ok((ops::drop_duplicates(flagged)?, report))
    }

    /// Combine cell-category relevance with the brand's target status.
    pub fn get_diagnostics(&self, cell_impacts: &DataFrame, brand_impacts: &DataFrame) -> Result<(DataFrame, JoinReport)> {
        let brand = ops::select_columns(brand_impacts.clone(), &BRAND_DIAGNOSTIC_COLUMNS)?;
        let (joined, report) = ops::inner_join("mbd_cat_cell", cell_impacts, &brand, &[MBD_ID, CATEGORY_NAME])?;

        let flags = col(CELL_CAT_TEST) + col(OUT_OF_TARGET);
        let diagnosed = joined
            .lazy()
            .with_columns([when(flags.gt_eq(lit(1i32)))
                .then(lit(ANOMALOUS))
                .otherwise(lit(NORMAL))
                .alias(MBD_CAT_DIAG)])
            .collect()?;

        let out = ops::drop_duplicates(ops::select_columns(diagnosed, &DIAGNOSTIC_COLUMNS)?)?;
        Ok((out, report))
    }
}

fn sales_impacts() -> [Expr; 2] {
    [
        relative_change(col(BASELINE_SALES), col(VUE_PROJECTED_SALES)).alias(VUE_SALES_IMPACT),
        relative_change(col(BASELINE_SALES), col(ADJ_PROJECTED_SALES)).alias(ADJ_SALES_IMPACT),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f64_at(df: &DataFrame, name: &str, idx: usize) -> f64 {
        df.column(name).unwrap().f64().unwrap().get(idx).unwrap()
    }

    fn i32_at(df: &DataFrame, name: &str, idx: usize) -> i32 {
        df.column(name).unwrap().i32().unwrap().get(idx).unwrap()
    }

    fn cells() -> DataFrame {
        df![
            "Cell_ID" => [1i64, 2, 3],
            "BAU_XFactor" => [2.0, 2.0, 1.0],
            "VUE_XFactor" => [2.2, 2.0, 1.0],
            "ADJ_XFactor" => [2.2, 1.8, 1.0]
        ]
        .unwrap()
    }

    fn vue_impacts() -> DataFrame {
        df![
            "MbdID" => ["10", "10", "20", "10"],
            "MbdName" => ["Brand A", "Brand A", "Brand B", "Brand A"],
            "Cell_ID" => [1i64, 2, 1, 9],
            "CategoryCode" => [7i64, 7, 8, 7],
            "CategoryName" => ["Soda", "Soda", "Snacks", "Soda"],
            "Baseline_Sales" => [100.0, 200.0, 50.0, 10.0],
            "Baseline_CellImportance" => [0.0, 0.5, 0.2, 0.1]
        ]
        .unwrap()
    }

    fn num_dist() -> DataFrame {
        df![
            "MbdID" => ["10", "20"],
            "CategoryName" => ["Soda", "Snacks"],
            "Numerical Distribution" => [0.8, 0.4]
        ]
        .unwrap()
    }

    fn type_target() -> DataFrame {
        df![
            "MbdID" => ["10", "20"],
            "MBD Type" => ["Main", "Secondary"],
            "Target" => [0.05, 0.1]
        ]
        .unwrap()
    }

    #[test]
    fn test_cell_impacts_projection_scenario() {
        let engine = ImpactDiagnosticsEngine;
        let thresholds = Thresholds::new(3.0, 0.1, 0.1, 0.05, 0.01).unwrap();
        let (impacts, report) = engine.compute_cell_impacts(&cells(), &vue_impacts(), &thresholds).unwrap();

        assert_eq!(impacts.height(), 3);
        assert_eq!(report.left_unmatched, 1);
        assert_eq!(report.right_unmatched, 1);

        assert_eq!(f64_at(&impacts, UNPROJECTED_SALES, 0), 50.0);
        assert_eq!(f64_at(&impacts, VUE_PROJECTED_SALES, 0), 110.0);
        assert_eq!(f64_at(&impacts, VUE_SALES_IMPACT, 0), 0.1);
        assert_eq!(f64_at(&impacts, ADJ_PROJECTED_SALES, 1), 180.0);
        assert_eq!(f64_at(&impacts, ADJ_SALES_IMPACT, 1), -0.1);
    }

    #[test]
    fn test_cell_cat_test_needs_impact_and_importance() {
        let engine = ImpactDiagnosticsEngine;
        let thresholds = Thresholds::new(3.0, 0.1, 0.1, 0.05, 0.01).unwrap();
        let cells = df![
            "Cell_ID" => [1i64, 2, 3],
            "BAU_XFactor" => [1.0, 1.0, 1.0],
            "VUE_XFactor" => [1.0, 1.0, 1.0],
            "ADJ_XFactor" => [1.05, 1.05, 1.01]
        ]
        .unwrap();
        let impacts = df![
            "MbdID" => ["10", "10", "10"],
            "MbdName" => ["A", "A", "A"],
            "Cell_ID" => [1i64, 2, 3],
            "CategoryCode" => [7i64, 7, 7],
            "CategoryName" => ["Soda", "Soda", "Soda"],
            "Baseline_Sales" => [100.0, 100.0, 100.0],
            "Baseline_CellImportance" => [0.0, 0.01, 0.5]
        ]
        .unwrap();

        let (out, _) = engine.compute_cell_impacts(&cells, &impacts, &thresholds).unwrap();

        assert_eq!(f64_at(&out, ADJ_SALES_IMPACT, 0), 0.05);
        // impact at threshold but no importance
        assert_eq!(i32_at(&out, CELL_CAT_TEST, 0), 0);
        // both at their thresholds
        assert_eq!(i32_at(&out, CELL_CAT_TEST, 1), 1);
        // important but small impact
        assert_eq!(i32_at(&out, CELL_CAT_TEST, 2), 0);
    }

    #[test]
    fn test_mbd_impact_is_impact_of_sums() {
        let engine = ImpactDiagnosticsEngine;
        let (impacts, _) = engine
            .compute_cell_impacts(&cells(), &vue_impacts(), &Thresholds::default())
            .unwrap();

        let mbd = engine.compute_mbd_impacts(&impacts).unwrap();
        assert_eq!(mbd.height(), 2);

        // sorted by MbdID: "10" then "20"
        let ids = mbd.column(MBD_ID).unwrap().str().unwrap();
        assert_eq!(ids.get(0), Some("10"));
        assert_eq!(f64_at(&mbd, BASELINE_SALES, 0), 300.0);
        assert_eq!(f64_at(&mbd, ADJ_PROJECTED_SALES, 0), 290.0);
        assert_eq!(f64_at(&mbd, ADJ_SALES_IMPACT, 0), -0.0333);
        assert_eq!(f64_at(&mbd, VUE_SALES_IMPACT, 0), 0.0333);
    }

    #[test]
    fn test_out_of_target_is_inclusive() {
        let engine = ImpactDiagnosticsEngine;
        let mbd = df![
            "MbdID" => ["10", "20", "30"],
            "CategoryName" => ["Soda", "Snacks", "Soda"],
            "ADJ_SalesImpact" => [-0.05, 0.0999, 0.2]
        ]
        .unwrap();
        let targets = df![
            "MbdID" => ["10", "20", "20"],
            "MBD Type" => ["Main", "Secondary", "Secondary"],
            "Target" => [0.05, 0.1, 0.1]
        ]
        .unwrap();

        let (out, report) = engine.merge_type_target(&mbd, &targets).unwrap();

        // the repeated target row fans out and collapses again
        assert_eq!(out.height(), 2);
        assert_eq!(report.left_unmatched, 1);
        assert_eq!(i32_at(&out, OUT_OF_TARGET, 0), 1);
        assert_eq!(i32_at(&out, OUT_OF_TARGET, 1), 0);
    }

    #[test]
    fn test_full_run_diagnostics() {
        let engine = ImpactDiagnosticsEngine;
        let cells = cells();
        let impacts = vue_impacts();
        let nd = num_dist();
        let tt = type_target();
        let inputs = ImpactInputs {
            cells: &cells,
            vue_impacts: &impacts,
            mbd_num_dist: &nd,
            mbd_type_target: &tt,
        };

        let mut seen = Vec::new();
        let result = engine
            .run(inputs, &Thresholds::default(), |artifact, df| {
                seen.push((artifact, df.height()));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, vec![(ImpactArtifact::BrandImpacts, 2), (ImpactArtifact::Diagnostics, 3)]);
        assert_eq!(result.brand_impacts.height(), 2);
        assert_eq!(result.diagnostics.get_column_names(), DIAGNOSTIC_COLUMNS.to_vec());
        assert_eq!(result.diagnostics.height(), 3);
        assert_eq!(result.joins.len(), 4);

        // Brand 10 moved -0.0333 against a 0.05 target: in target. Cell 2 of
        // brand 10 has a -0.1 impact with 0.5 importance: relevant.
        let diag = result.diagnostics.column(MBD_CAT_DIAG).unwrap().str().unwrap();
        assert_eq!(diag.get(0), Some(NORMAL));
        assert_eq!(diag.get(1), Some(ANOMALOUS));
        // Brand 20 moved 0.1 against a 0.1 target: out of target
        assert_eq!(diag.get(2), Some(ANOMALOUS));
        let out_of_target = result.brand_impacts.column(OUT_OF_TARGET).unwrap().i32().unwrap();
        assert_eq!(out_of_target.get(1), Some(1));
        assert_eq!(result.anomalous_count().unwrap(), 2);
    }

    #[test]
    fn test_artifact_error_stops_later_stages() {
        let engine = ImpactDiagnosticsEngine;
        let cells = cells();
        let impacts = vue_impacts();
        let nd = num_dist();
        let tt = type_target();
        let inputs = ImpactInputs {
            cells: &cells,
            vue_impacts: &impacts,
            mbd_num_dist: &nd,
            mbd_type_target: &tt,
        };

        let mut seen = Vec::new();
        let err = engine
            .run(inputs, &Thresholds::default(), |artifact, _| {
                seen.push(artifact);
                Err(crate::error::DiagnosticsError::Config("disk full".to_string()))
            })
            .unwrap_err();

        assert!(err.to_string().contains("disk full"));
        assert_eq!(seen, vec![ImpactArtifact::BrandImpacts]);
    }

    #[test]
    fn test_projection_ties_round_to_even() {
        let engine = ImpactDiagnosticsEngine;
        let cells = df![
            "Cell_ID" => [1i64, 2],
            "BAU_XFactor" => [8.0, 1.0],
            "VUE_XFactor" => [1.0, 1.0],
            "ADJ_XFactor" => [1.0, 33.0 / 32.0]
        ]
        .unwrap();
        let impacts = df![
            "MbdID" => ["10", "10"],
            "MbdName" => ["A", "A"],
            "Cell_ID" => [1i64, 2],
            "CategoryCode" => [7i64, 7],
            "CategoryName" => ["Soda", "Soda"],
            "Baseline_Sales" => [1.0, 32.0],
            "Baseline_CellImportance" => [0.5, 0.5]
        ]
        .unwrap();

        let (out, _) = engine.compute_cell_impacts(&cells, &impacts, &Thresholds::default()).unwrap();

        // 1 / 8 = 0.125 at two places
        assert_eq!(f64_at(&out, UNPROJECTED_SALES, 0), 0.12);
        // 32 -> 33 is +0.03125 at four places
        assert_eq!(f64_at(&out, ADJ_PROJECTED_SALES, 1), 33.0);
        assert_eq!(f64_at(&out, ADJ_SALES_IMPACT, 1), 0.0312);
    }

    #[test]
    fn test_duplicate_rows_collapse_in_diagnostics() {
        let engine = ImpactDiagnosticsEngine;
        let cells = cells();
        let mut impacts = vue_impacts();
        let first = impacts.head(Some(1));
        impacts.vstack_mut(&first).unwrap();
        let (cell_impacts, _) = engine
            .compute_cell_impacts(&cells, &impacts, &Thresholds::default())
            .unwrap();
        assert_eq!(cell_impacts.height(), 4);

        let (brand, _) = engine.compute_brand_impacts(&cell_impacts, &num_dist(), &type_target()).unwrap();
        let (diagnostics, _) = engine.get_diagnostics(&cell_impacts, &brand).unwrap();

        assert_eq!(diagnostics.height(), 3);
    }
}
