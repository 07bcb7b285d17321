//! Relational helpers shared by both engines: order-preserving joins with
//! drop accounting, column selection, de-duplication and the derived-metric
//! expressions.

use crate::error::Result;
use polars::prelude::*;
use serde::Serialize;
use tracing::{debug, warn};

const ROW_INDEX: &str = "__row_index";
const RIGHT_ROW_INDEX: &str = "__right_row_index";

/// Row accounting for one inner join.
///
/// Unmatched rows are dropped silently from the result; the counts here are
/// the only trace they leave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinReport {
    pub stage: String,
    pub on: Vec<String>,
    pub left_rows: usize,
    pub right_rows: usize,
    pub joined_rows: usize,
    pub left_unmatched: usize,
    pub right_unmatched: usize,
}

impl JoinReport {
    pub fn dropped_rows(&self) -> usize {
        self.left_unmatched + self.right_unmatched
    }
}

fn key_exprs(on: &[&str]) -> Vec<Expr> {
    on.iter().map(|c| col(c)).collect()
}

/// Join keeping the left table's row order, like a spreadsheet merge. Rows
/// fanned out by repeated right keys follow the right table's order.
fn ordered_join(left: &DataFrame, right: &DataFrame, on: &[&str], join_type: JoinType) -> Result<DataFrame> {
    let keys = key_exprs(on);
    let result = left
        .clone()
        .lazy()
        .with_row_index(ROW_INDEX, None)
        .join(
            right.clone().lazy().with_row_index(RIGHT_ROW_INDEX, None),
            keys.clone(),
            keys,
            JoinArgs::new(join_type),
        )
        .sort(
            [ROW_INDEX, RIGHT_ROW_INDEX],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .drop([ROW_INDEX, RIGHT_ROW_INDEX])
        .collect()?;
    Ok(result)
}

fn anti_join_count(left: &DataFrame, right: &DataFrame, on: &[&str]) -> Result<usize> {
    let keys = key_exprs(on);
    let unmatched = left
        .clone()
        .lazy()
        .join(right.clone().lazy(), keys.clone(), keys, JoinArgs::new(JoinType::Anti))
        .collect()?;
    Ok(unmatched.height())
}

/// Inner join on `on`, dropping unmatched rows from both sides and reporting
/// how many were dropped.
pub fn inner_join(
    stage: &str,
    left: &DataFrame,
    right: &DataFrame,
    on: &[&str],
) -> Result<(DataFrame, JoinReport)> {
    let joined = ordered_join(left, right, on, JoinType::Inner)?;

    let report = JoinReport {
        stage: stage.to_string(),
        on: on.iter().map(|c| c.to_string()).collect(),
        left_rows: left.height(),
        right_rows: right.height(),
        joined_rows: joined.height(),
        left_unmatched: anti_join_count(left, right, on)?,
        right_unmatched: anti_join_count(right, left, on)?,
    };

    if report.dropped_rows() > 0 {
        warn!(
            "{}: inner join on {:?} dropped {} left and {} right rows without a match",
            stage, on, report.left_unmatched, report.right_unmatched
        );
    }
    if report.joined_rows > report.left_rows {
        // Duplicate keys on the right fan rows out
        warn!(
            "{}: join on {:?} grew {} rows to {}",
            stage, on, report.left_rows, report.joined_rows
        );
    }
    debug!("{}: {:?}", stage, report);

    Ok((joined, report))
}

/// Left join on `on`; every left row is kept
pub fn left_join(left: &DataFrame, right: &DataFrame, on: &[&str]) -> Result<DataFrame> {
    ordered_join(left, right, on, JoinType::Left)
}

pub fn select_columns(df: DataFrame, columns: &[&str]) -> Result<DataFrame> {
    let exprs: Vec<Expr> = columns.iter().map(|c| col(c)).collect();
    Ok(df.lazy().select(exprs).collect()?)
}

/// Remove exact duplicate rows, keeping the first occurrence in place
pub fn drop_duplicates(df: DataFrame) -> Result<DataFrame> {
    Ok(df
        .lazy()
        .unique_stable(None, UniqueKeepStrategy::First)
        .collect()?)
}

/// Column read as Float64 so integer universes and panels divide as reals
pub fn fcol(name: &str) -> Expr {
    col(name).cast(DataType::Float64)
}

/// Round to `decimals` places with ties going to the even neighbour.
///
/// The value is scaled by `10^decimals` first, so `0.125` at two places is a
/// tie (12.5) and becomes `0.12`. Non-finite values pass through.
pub fn round_half_even(value: Expr, decimals: u32) -> Expr {
    let scale = 10f64.powi(decimals as i32);
    let scaled = value * lit(scale);
    let floor = scaled.clone().floor();
    let is_tie = (scaled.clone() - floor.clone()).eq(lit(0.5));
    let floor_is_even = (floor.clone() % lit(2.0)).eq(lit(0.0));
    let rounded = when(is_tie)
        .then(
            when(floor_is_even)
                .then(floor.clone())
                .otherwise(floor + lit(1.0)),
        )
        .otherwise(scaled.round(0));
    rounded / lit(scale)
}

/// `round(b / a - 1, 4)`; a zero `a` yields a non-finite value
pub fn relative_change(a: Expr, b: Expr) -> Expr {
    round_half_even((b / a) - lit(1.0), 4)
}

/// 0 when `|value| <= limit`, 1 otherwise (NaN fails)
pub fn flag_abs_above(value: Expr, limit: f64) -> Expr {
    when(value.clone().is_not_nan().and(value.abs().lt_eq(lit(limit))))
        .then(lit(0i32))
        .otherwise(lit(1i32))
}

/// 0 when `|value| < limit`, 1 otherwise (NaN fails)
pub fn flag_abs_at_least(value: Expr, limit: f64) -> Expr {
    when(value.clone().is_not_nan().and(value.abs().lt(lit(limit))))
        .then(lit(0i32))
        .otherwise(lit(1i32))
}

/// `value >= limit` with IEEE semantics, so NaN never satisfies it
pub fn ge_ieee(value: Expr, limit: Expr) -> Expr {
    value
        .clone()
        .is_not_nan()
        .and(limit.clone().is_not_nan())
        .and(value.gt_eq(limit))
}
