//! # IV/GMM Regression Engine
//!
//! Estimates transition-equation coefficients by instrumental-variable GMM.
//! [`assemble_iv_dataset`] turns a wide panel table plus named formula inputs
//! into three aligned numeric matrices (dependent vector, regressor design,
//! instrument design) after listwise deletion of rows with missing values;
//! [`iv_reg`] then solves the generalized IV normal equations with either the
//! one-step (`2sls`) or two-step efficient weight matrix.
//!
//! Every inversion goes through the symmetric pseudo-inverse, so singular
//! moment matrices degrade gracefully instead of aborting. When that fallback
//! engages, the offending matrix travels back to the caller as a
//! [`SingularMatrixWarning`] attached to the estimate; it is additionally
//! logged, but never only logged.

use crate::data::{self, ColumnBlock, DataError};
use crate::linalg::{self, PseudoInverse};
use crate::transition::{TransitionError, TransitionRegistry};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use ndarray_linalg::error::LinalgError;
use polars::prelude::DataFrame;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IvError {
    #[error("listwise deletion of rows with missing values left zero usable rows")]
    MissingData,
    #[error(
        "dependent variable, regressors, and instruments must be row-aligned (got {y_rows}, {x_rows}, {z_rows} rows)"
    )]
    RowMismatch {
        y_rows: usize,
        x_rows: usize,
        z_rows: usize,
    },
    #[error(
        "the instrument design has {k_prime} columns but at least {k} (the regressor column count) are required"
    )]
    TooFewInstruments { k: usize, k_prime: usize },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("eigendecomposition failed while inverting a GMM moment matrix: {0}")]
    Linalg(#[from] LinalgError),
}

/// Which weight matrix the GMM criterion uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMethod {
    /// One-step: weight = pseudo-inverse of the scaled instrument
    /// second-moment matrix `Z'Z / n`.
    TwoSls,
    /// Two-step efficient: re-weight by the pseudo-inverse of the
    /// residual-weighted instrument outer-product average and re-solve.
    Optimal,
}

/// Where in the GMM computation a singular matrix was encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingularContext {
    InstrumentMoment,
    ResidualWeight,
    NormalEquations,
}

impl fmt::Display for SingularContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SingularContext::InstrumentMoment => write!(f, "instrument second-moment"),
            SingularContext::ResidualWeight => write!(f, "residual-weighted instrument moment"),
            SingularContext::NormalEquations => write!(f, "IV normal-equation"),
        }
    }
}

/// Diagnostic payload for a recovered singular-matrix event.
///
/// The inversion already fell back to the pseudo-inverse; this carries the
/// offending matrix and its numerical rank so the caller can decide whether
/// the rank deficiency is expected (collinear instruments) or a data problem.
#[derive(Debug, Clone)]
pub struct SingularMatrixWarning {
    pub context: SingularContext,
    pub matrix: Array2<f64>,
    pub rank: usize,
    pub dim: usize,
}

/// Aligned numeric arrays for one IV regression.
#[derive(Debug, Clone)]
pub struct IvDataset {
    /// Dependent variable, length `n`.
    pub depvar: Array1<f64>,
    /// Regressor design, `n x k`, constant column last.
    pub indepvars: Array2<f64>,
    /// Instrument design, `n x k'` with `k' >= k`, constant column last.
    pub instruments: Array2<f64>,
    pub indepvar_labels: Vec<String>,
    pub instrument_labels: Vec<String>,
    /// Indices (into the original table) of the rows that survived listwise
    /// deletion.
    pub rows: Vec<usize>,
}

/// A fitted IV regression.
#[derive(Debug, Clone)]
pub struct IvEstimate {
    /// Coefficients in design-column order (constant last).
    pub beta: Array1<f64>,
    /// The weight matrix used for the final solve.
    pub weights: Array2<f64>,
    /// Singular-matrix events recovered via pseudo-inverse during the fit.
    pub warnings: Vec<SingularMatrixWarning>,
}

/// Builds the aligned arrays for an IV regression from the wide panel table.
///
/// Only the used columns are touched; any row with a missing value among them
/// is dropped (listwise deletion). The transition kind selects the registered
/// formula expansion that turns raw columns into the final designs.
pub fn assemble_iv_dataset(
    depvar_name: &str,
    indepvar_names: &[String],
    instrument_groups: &[Vec<String>],
    transition_kind: &str,
    registry: &TransitionRegistry,
    table: &DataFrame,
) -> Result<IvDataset, IvError> {
    let (indep_spec, instr_spec) =
        registry.expand(transition_kind, indepvar_names, instrument_groups)?;

    let instrument_names: Vec<String> = instrument_groups.iter().flatten().cloned().collect();
    let mut used: Vec<&str> = Vec::with_capacity(1 + indepvar_names.len() + instrument_names.len());
    used.push(depvar_name);
    for name in indepvar_names.iter().chain(instrument_names.iter()) {
        if !used.contains(&name.as_str()) {
            used.push(name);
        }
    }

    let mut columns = Vec::with_capacity(used.len());
    for name in &used {
        columns.push(data::numeric_column(table, name)?);
    }
    let n_total = table.height();
    let rows: Vec<usize> = (0..n_total)
        .filter(|&i| columns.iter().all(|c| !c[i].is_nan()))
        .collect();
    if rows.is_empty() {
        return Err(IvError::MissingData);
    }
    log::debug!(
        "iv dataset for '{depvar_name}': kept {} of {n_total} rows after listwise deletion",
        rows.len()
    );

    let column_of = |name: &str| -> usize {
        used.iter()
            .position(|u| *u == name)
            .expect("every used name was extracted")
    };
    let gather = |names: &[String]| -> ColumnBlock {
        let mut values = Array2::<f64>::zeros((rows.len(), names.len()));
        for (j, name) in names.iter().enumerate() {
            let source = &columns[column_of(name)];
            for (out_i, &row) in rows.iter().enumerate() {
                values[[out_i, j]] = source[row];
            }
        }
        ColumnBlock {
            names: names.to_vec(),
            values,
        }
    };

    let dep_source = &columns[column_of(depvar_name)];
    let depvar = Array1::from_iter(rows.iter().map(|&i| dep_source[i]));
    let x_block = gather(indepvar_names);
    let z_block = gather(&instrument_names);

    let indepvars = indep_spec.build(&x_block)?;
    let instruments = instr_spec.build(&z_block)?;

    Ok(IvDataset {
        depvar,
        indepvars,
        instruments,
        indepvar_labels: indep_spec.column_labels(),
        instrument_labels: instr_spec.column_labels(),
        rows,
    })
}

/// Estimates a linear-in-parameters IV equation via GMM.
///
/// Inputs must be free of missing values, row-aligned, and carry their
/// constant columns explicitly; [`assemble_iv_dataset`] produces exactly this
/// shape. Returns the coefficient vector alongside the final weight matrix
/// and any recovered singular-matrix diagnostics.
pub fn iv_reg(
    depvar: ArrayView1<f64>,
    indepvars: ArrayView2<f64>,
    instruments: ArrayView2<f64>,
    fit_method: FitMethod,
) -> Result<IvEstimate, IvError> {
    let (y, x, z) = (depvar, indepvars, instruments);
    if y.len() != x.nrows() || x.nrows() != z.nrows() {
        return Err(IvError::RowMismatch {
            y_rows: y.len(),
            x_rows: x.nrows(),
            z_rows: z.nrows(),
        });
    }
    if z.ncols() < x.ncols() {
        return Err(IvError::TooFewInstruments {
            k: x.ncols(),
            k_prime: z.ncols(),
        });
    }

    let mut warnings = Vec::new();
    let (mut weights, warning) = gmm_weights(&z, None)?;
    warnings.extend(warning);
    let (mut beta, warning) = solve_normal_equations(&y, &x, &z, &weights)?;
    warnings.extend(warning);

    if fit_method == FitMethod::Optimal {
        let residuals = y.to_owned() - x.dot(&beta);
        let (reweighted, warning) = gmm_weights(&z, Some(&residuals))?;
        warnings.extend(warning);
        weights = reweighted;
        let (resolved, warning) = solve_normal_equations(&y, &x, &z, &weights)?;
        warnings.extend(warning);
        beta = resolved;
    }

    Ok(IvEstimate {
        beta,
        weights,
        warnings,
    })
}

/// GMM weight matrix: `pinv(Z'Z / n)` without residuals, or the pseudo-inverse
/// of the residual-weighted outer-product average `(1/n) sum u_i^2 z_i z_i'`.
fn gmm_weights(
    z: &ArrayView2<f64>,
    residuals: Option<&Array1<f64>>,
) -> Result<(Array2<f64>, Option<SingularMatrixWarning>), LinalgError> {
    let n = z.nrows() as f64;
    let (moment, context) = match residuals {
        None => (z.t().dot(z) / n, SingularContext::InstrumentMoment),
        Some(u) => {
            let k_prime = z.ncols();
            let mut s = Array2::<f64>::zeros((k_prime, k_prime));
            for (i, &ui) in u.iter().enumerate() {
                let zi = z.row(i);
                let u_squared = ui * ui;
                for a in 0..k_prime {
                    let za = u_squared * zi[a];
                    for b in 0..k_prime {
                        s[[a, b]] += za * zi[b];
                    }
                }
            }
            s /= n;
            (s, SingularContext::ResidualWeight)
        }
    };
    let pinv = linalg::sym_pseudo_inverse(&moment.view())?;
    let warning = deficiency_warning(context, moment, &pinv);
    Ok((pinv.inverse, warning))
}

/// Solves `beta = [ (X'Z) W (X'Z)' ]^+ (X'Z) W (Z'y)`.
fn solve_normal_equations(
    y: &ArrayView1<f64>,
    x: &ArrayView2<f64>,
    z: &ArrayView2<f64>,
    weights: &Array2<f64>,
) -> Result<(Array1<f64>, Option<SingularMatrixWarning>), LinalgError> {
    let xtz = x.t().dot(z);
    let helper = xtz.dot(weights);
    let bracket = helper.dot(&xtz.t());
    let pinv = linalg::sym_pseudo_inverse(&bracket.view())?;
    let warning = deficiency_warning(SingularContext::NormalEquations, bracket, &pinv);
    let y_part = helper.dot(&z.t().dot(y));
    Ok((pinv.inverse.dot(&y_part), warning))
}

fn deficiency_warning(
    context: SingularContext,
    matrix: Array2<f64>,
    pinv: &PseudoInverse,
) -> Option<SingularMatrixWarning> {
    if pinv.is_full_rank() {
        return None;
    }
    log::warn!(
        "{context} matrix is singular (rank {} of {}); recovered via pseudo-inverse",
        pinv.rank,
        pinv.dim
    );
    Some(SingularMatrixWarning {
        context,
        matrix,
        rank: pinv.rank,
        dim: pinv.dim,
    })
}
