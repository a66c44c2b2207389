//! # Panel Data Access
//!
//! Thin layer between the wide panel table (a `polars` `DataFrame`) and the
//! `ndarray` structures the numeric core operates on. Columns are extracted as
//! `f64` with every null mapped to NaN, so downstream code has a single
//! missing-value representation to deal with. Rows may repeat an observation
//! identifier across time periods; `period_slice` cuts out one period by the
//! value of a period-marker column.

use ndarray::{Array2, ArrayView1};
use polars::prelude::*;
use thiserror::Error;

/// Errors raised while pulling columns out of the panel table.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("the column '{0}' was not found in the panel table")]
    ColumnNotFound(String),
    #[error(
        "the column '{column_name}' could not be converted to f64 (found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
}

/// A named block of numeric columns, aligned row-wise.
///
/// This is the shape in which assembled regressor and instrument columns are
/// handed to a formula expansion: provenance is carried by the block itself,
/// not by prefixed column names.
#[derive(Debug, Clone)]
pub struct ColumnBlock {
    pub names: Vec<String>,
    /// Shape `[n_rows, names.len()]`.
    pub values: Array2<f64>,
}

impl ColumnBlock {
    pub fn column(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.values.column(idx))
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }
}

/// Extracts a single column as `f64`, mapping nulls to NaN.
pub fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, DataError> {
    let column = df
        .column(name)
        .map_err(|_| DataError::ColumnNotFound(name.to_string()))?;
    let casted = column.cast(&DataType::Float64).map_err(|_| {
        DataError::ColumnWrongType {
            column_name: name.to_string(),
            found_type: format!("{:?}", column.dtype()),
        }
    })?;
    let chunked = casted.f64()?.rechunk();
    let mut values = Vec::with_capacity(chunked.len());
    for i in 0..chunked.len() {
        values.push(chunked.get(i).unwrap_or(f64::NAN));
    }
    Ok(values)
}

/// Extracts the named columns into an `[n_rows, n_cols]` matrix, nulls as NaN.
///
/// Column order in the result matches the order of `names`, which is what
/// guarantees reproducible iteration order in the estimators built on top.
pub fn numeric_matrix(df: &DataFrame, names: &[String]) -> Result<Array2<f64>, DataError> {
    let n = df.height();
    let mut out = Array2::<f64>::zeros((n, names.len()));
    for (j, name) in names.iter().enumerate() {
        let values = numeric_column(df, name)?;
        for (i, &v) in values.iter().enumerate() {
            out[[i, j]] = v;
        }
    }
    Ok(out)
}

/// Returns the rows of `df` whose period-marker column equals `period`.
pub fn period_slice(df: &DataFrame, period_col: &str, period: f64) -> Result<DataFrame, DataError> {
    let marker = numeric_column(df, period_col)?;
    let mask: Vec<bool> = marker.iter().map(|&v| v == period).collect();
    let mask = BooleanChunked::from_slice(PlSmallStr::from_static("period_mask"), &mask);
    Ok(df.filter(&mask)?)
}
