//! # Covariance Decomposer
//!
//! Splits one period's full measurement covariance matrix into latent-factor
//! covariances and measurement-error variances. After de-scaling the matrix
//! by the outer product of loadings, every off-diagonal cell of a factor-pair
//! block is (under the model) an estimate of the same latent covariance, so
//! the block mean is used as the estimate. Within-factor estimates are then
//! subtracted from the de-scaled diagonal to isolate measurement noise.
//!
//! No positive-definiteness correction is applied; the result is a plain
//! method-of-moments estimate and downstream consumers decide whether to
//! project it.

use crate::moments::{CovMatrix, NamedValues};
use itertools::iproduct;
use ndarray::Array2;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecompositionError {
    #[error("no loading was supplied for measurement '{0}'")]
    MissingLoading(String),
    #[error("measurement '{0}' has a zero loading; its covariances cannot be de-scaled")]
    ZeroLoading(String),
    #[error(
        "measurement '{measurement}' of factor '{factor}' is not in the covariance matrix"
    )]
    UnknownMeasurement { factor: String, measurement: String },
    #[error(
        "the covariance between factors '{factor1}' and '{factor2}' is not identified: no off-diagonal measurement pairs are available"
    )]
    UnidentifiedFactorCovariance { factor1: String, factor2: String },
}

/// Output of [`factor_covs_and_measurement_error_variances`].
#[derive(Debug, Clone)]
pub struct CovDecomposition {
    /// Upper-triangular latent covariances, flattened row-wise in
    /// sorted-factor order: `(f0,f0), (f0,f1), ..., (f1,f1), ...`.
    pub factor_covs: Vec<f64>,
    /// Idiosyncratic error variance per measurement, in the covariance
    /// matrix's measurement order.
    pub meas_error_variances: NamedValues,
}

/// Latent factor covariances and measurement-error variances for one period.
///
/// `meas_per_factor` maps each factor to its measurement list for the period;
/// iteration follows the map's sorted key order, which fixes the layout of
/// the flattened `factor_covs` output.
pub fn factor_covs_and_measurement_error_variances(
    meas_cov: &CovMatrix,
    loadings: &NamedValues,
    meas_per_factor: &BTreeMap<String, Vec<String>>,
) -> Result<CovDecomposition, DecompositionError> {
    let dim = meas_cov.names.len();
    let mut scale = Vec::with_capacity(dim);
    for name in &meas_cov.names {
        let loading = loadings
            .get(name)
            .ok_or_else(|| DecompositionError::MissingLoading(name.clone()))?;
        if loading == 0.0 {
            return Err(DecompositionError::ZeroLoading(name.clone()));
        }
        scale.push(loading);
    }

    let mut scaled = Array2::<f64>::zeros((dim, dim));
    for i in 0..dim {
        for j in 0..dim {
            scaled[[i, j]] = meas_cov.values[[i, j]] / (scale[i] * scale[j]);
        }
    }
    let mut descaled_diag: Vec<f64> = (0..dim).map(|i| scaled[[i, i]]).collect();

    // Resolve each factor's measurement names to matrix indices once.
    let mut factor_indices: Vec<(&String, Vec<usize>)> = Vec::with_capacity(meas_per_factor.len());
    for (factor, meas_list) in meas_per_factor {
        let mut indices = Vec::with_capacity(meas_list.len());
        for measurement in meas_list {
            let idx = meas_cov.index_of(measurement).ok_or_else(|| {
                DecompositionError::UnknownMeasurement {
                    factor: factor.clone(),
                    measurement: measurement.clone(),
                }
            })?;
            indices.push(idx);
        }
        factor_indices.push((factor, indices));
    }

    let num_factors = factor_indices.len();
    let mut factor_covs = Vec::with_capacity(num_factors * (num_factors + 1) / 2);
    for f1 in 0..num_factors {
        for f2 in f1..num_factors {
            let within = f1 == f2;
            let indices1 = &factor_indices[f1].1;
            let indices2 = &factor_indices[f2].1;
            let mut acc = 0.0;
            let mut count = 0usize;
            for (&i, &j) in iproduct!(indices1.iter(), indices2.iter()) {
                // Diagonal cells mix in measurement noise; they are handled
                // separately below.
                if within && i == j {
                    continue;
                }
                acc += scaled[[i, j]];
                count += 1;
            }
            if count == 0 {
                return Err(DecompositionError::UnidentifiedFactorCovariance {
                    factor1: factor_indices[f1].0.clone(),
                    factor2: factor_indices[f2].0.clone(),
                });
            }
            let cov_estimate = acc / count as f64;
            factor_covs.push(cov_estimate);
            if within {
                for &i in indices1.iter() {
                    descaled_diag[i] -= cov_estimate;
                }
            }
        }
    }

    let meas_error_variances = meas_cov
        .names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), descaled_diag[i] * scale[i] * scale[i]))
        .collect();

    Ok(CovDecomposition {
        factor_covs,
        meas_error_variances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn named(names: &[&str], values: &[f64]) -> NamedValues {
        names
            .iter()
            .map(|n| n.to_string())
            .zip(values.iter().copied())
            .collect()
    }

    /// Builds the exact model-implied covariance matrix for given loadings,
    /// factor covariance blocks, and error variances.
    fn implied_cov(
        names: &[&str],
        loadings: &[f64],
        factor_of: &[usize],
        factor_cov: &Array2<f64>,
        error_vars: &[f64],
    ) -> CovMatrix {
        let dim = names.len();
        let mut values = Array2::<f64>::zeros((dim, dim));
        for i in 0..dim {
            for j in 0..dim {
                let latent = factor_cov[[factor_of[i], factor_of[j]]];
                values[[i, j]] = loadings[i] * loadings[j] * latent;
                if i == j {
                    values[[i, j]] += error_vars[i];
                }
            }
        }
        CovMatrix {
            names: names.iter().map(|n| n.to_string()).collect(),
            values,
        }
    }

    #[test]
    fn single_factor_decomposition_is_exact() {
        let names = ["y1", "y2", "y3"];
        let loadings = [1.0, 2.0, 3.0];
        let error_vars = [0.5, 0.4, 0.3];
        let factor_cov = ndarray::array![[2.0]];
        let cov = implied_cov(&names, &loadings, &[0, 0, 0], &factor_cov, &error_vars);

        let mut meas_per_factor = BTreeMap::new();
        meas_per_factor.insert(
            "skill".to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        );

        let decomp = factor_covs_and_measurement_error_variances(
            &cov,
            &named(&names, &loadings),
            &meas_per_factor,
        )
        .unwrap();

        assert_eq!(decomp.factor_covs.len(), 1);
        assert_abs_diff_eq!(decomp.factor_covs[0], 2.0, epsilon = 1e-10);
        for (i, name) in names.iter().enumerate() {
            assert_abs_diff_eq!(
                decomp.meas_error_variances.get(name).unwrap(),
                error_vars[i],
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn diagonal_identity_reassembles_original_variances() {
        // var(y_i) == loading_i^2 * factor_var + error_var_i must hold after
        // the decomposition, by construction of the estimator.
        let names = ["y1", "y2", "y3", "y4"];
        let loadings = [1.0, 0.8, 1.3, 2.0];
        let error_vars = [0.2, 0.6, 0.1, 0.9];
        let factor_cov = ndarray::array![[1.7]];
        let cov = implied_cov(&names, &loadings, &[0, 0, 0, 0], &factor_cov, &error_vars);

        let mut meas_per_factor = BTreeMap::new();
        meas_per_factor.insert(
            "f".to_string(),
            names.iter().map(|n| n.to_string()).collect(),
        );
        let decomp = factor_covs_and_measurement_error_variances(
            &cov,
            &named(&names, &loadings),
            &meas_per_factor,
        )
        .unwrap();

        for (i, name) in names.iter().enumerate() {
            let reassembled = loadings[i] * loadings[i] * decomp.factor_covs[0]
                + decomp.meas_error_variances.get(name).unwrap();
            assert_abs_diff_eq!(reassembled, cov.values[[i, i]], epsilon = 1e-10);
        }
    }

    #[test]
    fn two_factor_cross_covariances_are_recovered_in_sorted_order() {
        let names = ["a1", "a2", "a3", "b1", "b2", "b3"];
        let loadings = [1.0, 2.0, 0.5, 1.0, 1.5, 3.0];
        let error_vars = [0.1; 6];
        let factor_cov = ndarray::array![[1.2, 0.4], [0.4, 0.9]];
        let factor_of = [0, 0, 0, 1, 1, 1];
        let cov = implied_cov(&names, &loadings, &factor_of, &factor_cov, &error_vars);

        let mut meas_per_factor = BTreeMap::new();
        meas_per_factor.insert(
            "alpha".to_string(),
            vec!["a1".to_string(), "a2".to_string(), "a3".to_string()],
        );
        meas_per_factor.insert(
            "beta".to_string(),
            vec!["b1".to_string(), "b2".to_string(), "b3".to_string()],
        );

        let decomp = factor_covs_and_measurement_error_variances(
            &cov,
            &named(&names, &loadings),
            &meas_per_factor,
        )
        .unwrap();

        // Flattened upper triangle: (alpha,alpha), (alpha,beta), (beta,beta).
        assert_eq!(decomp.factor_covs.len(), 3);
        assert_abs_diff_eq!(decomp.factor_covs[0], 1.2, epsilon = 1e-10);
        assert_abs_diff_eq!(decomp.factor_covs[1], 0.4, epsilon = 1e-10);
        assert_abs_diff_eq!(decomp.factor_covs[2], 0.9, epsilon = 1e-10);
    }

    #[test]
    fn zero_loading_is_rejected() {
        let names = ["y1", "y2"];
        let cov = CovMatrix {
            names: names.iter().map(|n| n.to_string()).collect(),
            values: ndarray::array![[1.0, 0.5], [0.5, 1.0]],
        };
        let mut meas_per_factor = BTreeMap::new();
        meas_per_factor.insert(
            "f".to_string(),
            vec!["y1".to_string(), "y2".to_string()],
        );
        let err = factor_covs_and_measurement_error_variances(
            &cov,
            &named(&names, &[1.0, 0.0]),
            &meas_per_factor,
        )
        .unwrap_err();
        match err {
            DecompositionError::ZeroLoading(name) => assert_eq!(name, "y2"),
            other => panic!("expected ZeroLoading, got {other:?}"),
        }
    }

    #[test]
    fn single_measurement_factor_variance_is_unidentified() {
        let names = ["y1"];
        let cov = CovMatrix {
            names: vec!["y1".to_string()],
            values: ndarray::array![[1.0]],
        };
        let mut meas_per_factor = BTreeMap::new();
        meas_per_factor.insert("f".to_string(), vec!["y1".to_string()]);
        let err = factor_covs_and_measurement_error_variances(
            &cov,
            &named(&names, &[1.0]),
            &meas_per_factor,
        )
        .unwrap_err();
        match err {
            DecompositionError::UnidentifiedFactorCovariance { factor1, factor2 } => {
                assert_eq!(factor1, "f");
                assert_eq!(factor2, "f");
            }
            other => panic!("expected UnidentifiedFactorCovariance, got {other:?}"),
        }
    }
}
