//! # Symmetric Pseudo-Inverse
//!
//! Moore-Penrose inverse of symmetric matrices via eigendecomposition. Every
//! inversion in the GMM engine goes through here: the instrument second-moment
//! matrix, the residual-weighted outer-product average, and the bracketed term
//! of the IV normal equations are all symmetric and prone to rank deficiency,
//! so callers get the numerical rank back alongside the inverse and can
//! surface a diagnostic when it falls short of full rank.

use ndarray::{Array1, Array2, ArrayView2};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Eigh, UPLO};

/// Eigenvalues with magnitude below `max |eig| * RANK_TOL` are treated as zero.
const RANK_TOL: f64 = 1e-12;

/// A pseudo-inverse together with the numerical rank of its input.
#[derive(Debug, Clone)]
pub struct PseudoInverse {
    pub inverse: Array2<f64>,
    pub rank: usize,
    pub dim: usize,
}

impl PseudoInverse {
    pub fn is_full_rank(&self) -> bool {
        self.rank == self.dim
    }
}

/// Pseudo-inverse of a symmetric matrix.
///
/// Only the lower triangle of `matrix` is read. Eigenvalues within the rank
/// tolerance of zero are dropped rather than inverted, so a singular input
/// yields a finite result instead of an error.
pub fn sym_pseudo_inverse(matrix: &ArrayView2<f64>) -> Result<PseudoInverse, LinalgError> {
    let dim = matrix.nrows();
    let (eigvals, eigvecs) = matrix.eigh(UPLO::Lower)?;
    let max_abs = eigvals.iter().fold(0.0f64, |acc, &e| acc.max(e.abs()));
    let tol = max_abs * RANK_TOL;

    let mut rank = 0usize;
    let mut d_plus = Array1::<f64>::zeros(dim);
    for (i, &eig) in eigvals.iter().enumerate() {
        if eig.abs() > tol && eig.abs() > 0.0 {
            d_plus[i] = 1.0 / eig;
            rank += 1;
        }
    }

    let inverse = eigvecs.dot(&Array2::from_diag(&d_plus)).dot(&eigvecs.t());
    Ok(PseudoInverse { inverse, rank, dim })
}
