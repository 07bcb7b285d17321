//! Input file contract: expected file names, declared columns and the numeric
//! type table applied while loading.

use lazy_static::lazy_static;
use std::collections::HashMap;

pub const CELLS_CHARS: &str = "Cells_Chars.csv";
pub const CELLS_LAST_PERIOD: &str = "Cells_LastPeriod.csv";
pub const MBD_NUM_DIST: &str = "MBD_NumDist.csv";
pub const MBD_TYPE_TARGET: &str = "MBD_TypeTarget.csv";
pub const VUE_IMPACTS: &str = "VUE_Impacts.csv";
pub const VUE_SAMPLE_NSPC: &str = "VUE_SampleNSPC.csv";

pub const XZ_TEMPLATE_OUTPUT: &str = "XZTemplate_v0.csv";
pub const MBD_CAT_IMPACTS_OUTPUT: &str = "MBDCat_Impacts_v0.csv";
pub const MBD_CAT_CELL_IMPACTS_OUTPUT: &str = "MBDCatCell_Impacts_v0.csv";
pub const RUN_SUMMARY_OUTPUT: &str = "run_summary.json";

/// Column whose values keep only the suffix after the last underscore
pub const MBD_ID: &str = "MbdID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    Float,
    Text,
}

impl ColumnKind {
    pub fn label(&self) -> &'static str {
        match self {
            ColumnKind::Int => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Text => "text",
        }
    }
}

/// All input file names in their canonical order
pub const INPUT_FILES: [&str; 6] = [
    CELLS_CHARS,
    CELLS_LAST_PERIOD,
    MBD_NUM_DIST,
    MBD_TYPE_TARGET,
    VUE_IMPACTS,
    VUE_SAMPLE_NSPC,
];

lazy_static! {
    static ref DECLARED_COLUMNS: HashMap<&'static str, Vec<&'static str>> = {
        let mut m = HashMap::new();
        m.insert(
            CELLS_CHARS,
            vec!["INDEX", "CHANNEL", "SAMPLE", "Cell_ID", "StoreTypeChannel", "NielsenArea", "StoreType"],
        );
        m.insert(
            CELLS_LAST_PERIOD,
            vec![
                "Period", "Cell_ID", "Cell_Name", "XPanel", "ZPanel", "XUniverse", "ZUniverse",
                "XFactor", "ZFactor", "Condition",
            ],
        );
        m.insert(
            MBD_NUM_DIST,
            vec!["MbdID", "INDEX", "MbdName", "CategoryName", "Numerical Distribution"],
        );
        m.insert(
            MBD_TYPE_TARGET,
            vec!["MbdID", "INDEX", "MbdName", "MBD Type", "Target"],
        );
        m.insert(
            VUE_IMPACTS,
            vec![
                "PeriodId", "PeriodName", "ReportingGroupID", "ReportingGroupName", "MbdOrder",
                "MbdID", "MbdName", "Cell_ID", "CellName", "CategoryCode", "CategoryName",
                "ProductSegmentLevel", "productsegmentname", "Baseline_Sales",
                "Baseline_CellImportance", "NSPC_W1_Sales", "NSPC_W1_Baseline_Impact",
                "NSPC_W1_CellImportance",
            ],
        );
        m.insert(
            VUE_SAMPLE_NSPC,
            vec![
                "Period", "Period_Nm", "Sample_ID", "Sample_Nm", "Cell ID", "Cell_Name",
                "Cell_Condition", "X Universe", "Z Universe", "X Panel", "Z Panel", "X Factor",
                "Z Factor", "XZ_Ratio", "IBD ID", "IBD Name",
            ],
        );
        m
    };

    static ref NUMERIC_COLUMNS: HashMap<&'static str, ColumnKind> = {
        use ColumnKind::{Float, Int};
        [
            ("Cell_ID", Int),
            ("Period", Int),
            ("XPanel", Int),
            ("ZPanel", Int),
            ("XUniverse", Int),
            ("ZUniverse", Int),
            ("XFactor", Float),
            ("ZFactor", Float),
            ("Numerical Distribution", Float),
            ("Target", Float),
            ("PeriodId", Int),
            ("MbdOrder", Int),
            ("CategoryCode", Int),
            ("Baseline_Sales", Float),
            ("Baseline_CellImportance", Float),
            ("NSPC_W1_Sales", Float),
            ("NSPC_W1_Baseline_Impact", Float),
            ("NSPC_W1_CellImportance", Float),
            ("X Universe", Int),
            ("Z Universe", Int),
            ("X Panel", Int),
            ("Z Panel", Int),
            ("X Factor", Float),
            ("Z Factor", Float),
            ("XZ_Ratio", Float),
        ]
        .into_iter()
        .collect()
    };
}

/// Declared column set for an input file, `None` for unknown names
pub fn declared_columns(file_name: &str) -> Option<&'static [&'static str]> {
    DECLARED_COLUMNS.get(file_name).map(|cols| cols.as_slice())
}

/// Load-time type of a column; anything outside the numeric table is text
pub fn column_kind(column: &str) -> ColumnKind {
    NUMERIC_COLUMNS.get(column).copied().unwrap_or(ColumnKind::Text)
}

pub fn is_input_file(file_name: &str) -> bool {
    DECLARED_COLUMNS.contains_key(file_name)
}
