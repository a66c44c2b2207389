//! # Residual Variance Decomposer
//!
//! Recovers the variance of transition shocks and of the anchoring equation's
//! intrinsic noise from the second moments of IV regression residuals. Both
//! operations are pure aggregations: de-scale residual covariances by the
//! loadings that entered the regression, then average.

use crate::moments::NamedValues;
use ndarray::ArrayView2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResidualVarianceError {
    #[error(
        "residual covariance table is {rows}x{cols} but {row_loadings} row and {col_loadings} column loadings were supplied"
    )]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        row_loadings: usize,
        col_loadings: usize,
    },
    #[error("a de-scaling loading is zero; the residual variance is not identified")]
    ZeroLoading,
    #[error(
        "{permutations} instrument permutations were supplied for {variances} residual variances"
    )]
    PermutationMismatch {
        permutations: usize,
        variances: usize,
    },
    #[error(
        "permutation {permutation} names {found} measurements but there are {expected} anchored factors"
    )]
    PermutationLength {
        permutation: usize,
        found: usize,
        expected: usize,
    },
    #[error("no loading was supplied for measurement '{0}'")]
    MissingLoading(String),
    #[error("the residual variance decomposition received no inputs to average")]
    Empty,
}

/// Transition-shock variance from a table of residual covariances.
///
/// Each cell of `u_covs` is the covariance of residuals from two regressions
/// whose dependent measurements carry `row_loadings[i]` and `col_loadings[j]`;
/// under the model every de-scaled cell estimates the same shock variance, so
/// the equal-weight mean over all cells is returned.
pub fn transition_error_variance_from_u_covs(
    u_covs: &ArrayView2<f64>,
    row_loadings: &[f64],
    col_loadings: &[f64],
) -> Result<f64, ResidualVarianceError> {
    if u_covs.nrows() != row_loadings.len() || u_covs.ncols() != col_loadings.len() {
        return Err(ResidualVarianceError::ShapeMismatch {
            rows: u_covs.nrows(),
            cols: u_covs.ncols(),
            row_loadings: row_loadings.len(),
            col_loadings: col_loadings.len(),
        });
    }
    if u_covs.is_empty() {
        return Err(ResidualVarianceError::Empty);
    }
    let mut acc = 0.0;
    for (i, &row_loading) in row_loadings.iter().enumerate() {
        for (j, &col_loading) in col_loadings.iter().enumerate() {
            let scale = row_loading * col_loading;
            if scale == 0.0 {
                return Err(ResidualVarianceError::ZeroLoading);
            }
            acc += u_covs[[i, j]] / scale;
        }
    }
    Ok(acc / u_covs.len() as f64)
}

/// Anchoring-equation noise variance from per-permutation residual variances.
///
/// Each regression instruments the anchored factors with a different
/// permutation of their measurements; `permutations[p][f]` names the
/// measurement standing in for anchored factor `f` in regression `p`. The
/// portion of each residual variance attributable to that measurement's own
/// noise is `u_vars[p] / meas_loading^2 * anch_loading^2`; what remains after
/// subtracting all factors' portions estimates the anchoring equation's
/// intrinsic noise, and the estimates are averaged across permutations.
pub fn anchoring_error_variance_from_u_vars(
    u_vars: &[f64],
    permutations: &[Vec<String>],
    anch_loadings: &[f64],
    meas_loadings: &NamedValues,
) -> Result<f64, ResidualVarianceError> {
    if permutations.len() != u_vars.len() {
        return Err(ResidualVarianceError::PermutationMismatch {
            permutations: permutations.len(),
            variances: u_vars.len(),
        });
    }
    if u_vars.is_empty() {
        return Err(ResidualVarianceError::Empty);
    }

    let mut acc = 0.0;
    for (p, (perm, &u_var)) in permutations.iter().zip(u_vars.iter()).enumerate() {
        if perm.len() != anch_loadings.len() {
            return Err(ResidualVarianceError::PermutationLength {
                permutation: p,
                found: perm.len(),
                expected: anch_loadings.len(),
            });
        }
        let mut meas_noise = 0.0;
        for (meas_name, &anch_loading) in perm.iter().zip(anch_loadings.iter()) {
            let meas_loading = meas_loadings
                .get(meas_name)
                .ok_or_else(|| ResidualVarianceError::MissingLoading(meas_name.clone()))?;
            if meas_loading == 0.0 {
                return Err(ResidualVarianceError::ZeroLoading);
            }
            meas_noise += u_var / (meas_loading * meas_loading) * anch_loading * anch_loading;
        }
        acc += u_var - meas_noise;
    }
    Ok(acc / u_vars.len() as f64)
}
