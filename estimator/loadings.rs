//! # Initial-Period Measurement Coefficients
//!
//! Covariance-ratio estimation of factor loadings and mean-based estimation
//! of measurement intercepts, for the first period of the panel. No
//! regression is involved: loadings are identified as averages of ratios of
//! measurement covariances, which requires at least three proxies per factor,
//! and intercepts follow from proxy means once the loadings are known.
//!
//! [`initial_measurement_coeffs`] drives both estimators across all factors
//! of a validated [`ModelSpec`]; factors are independent, so the per-factor
//! work runs on the rayon pool.

use crate::data::{self, DataError};
use crate::model::{ModelSpec, Normalization, SpecError};
use crate::moments::{self, CovMatrix, NamedValues};
use polars::prelude::DataFrame;
use rayon::prelude::*;
use thiserror::Error;

/// Covariance-ratio identification needs the normalized proxy plus two others.
const MIN_MEASUREMENTS: usize = 3;

#[derive(Error, Debug)]
pub enum LoadingsError {
    #[error(
        "covariance-based factor loading estimation needs at least {MIN_MEASUREMENTS} measurements, but only {found} were supplied"
    )]
    InsufficientMeasurements { found: usize },
    #[error(
        "the normalization references measurement '{0}', which is not among the supplied measurements"
    )]
    UnknownNormalizedMeasurement(String),
    #[error("no loading was supplied for measurement '{0}'")]
    MissingLoading(String),
    #[error(
        "the loading of the normalized measurement '{0}' is zero; the factor mean is not identified"
    )]
    ZeroLoading(String),
    #[error(
        "the covariance between '{a}' and '{b}' is zero or undefined; the loading ratio for this factor is not identified"
    )]
    DegenerateCovariance { a: String, b: String },
    #[error("factor '{0}' has no loading normalization in the initial period")]
    MissingLoadingNormalization(String),
    #[error("factor '{0}' has no measurement list for the initial period")]
    NoInitialPeriod(String),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Data(#[from] DataError),
}

/// Factor loadings of the measurements of one factor, from covariance ratios.
///
/// The normalized measurement's loading equals the normalization value
/// exactly. Every other loading is the equal-weight mean, over all third
/// measurements `m'`, of `value * cov(m, m') / cov(normalized, m')`. A zero
/// or undefined denominator covariance is a data-quality error, not a NaN.
pub fn loadings_from_covs(
    data: &DataFrame,
    measurements: &[String],
    normalization: &Normalization,
) -> Result<NamedValues, LoadingsError> {
    if measurements.len() < MIN_MEASUREMENTS {
        return Err(LoadingsError::InsufficientMeasurements {
            found: measurements.len(),
        });
    }
    if !measurements.contains(&normalization.measurement) {
        return Err(LoadingsError::UnknownNormalizedMeasurement(
            normalization.measurement.clone(),
        ));
    }

    let matrix = data::numeric_matrix(data, measurements)?;
    let cov = moments::pairwise_covariance(&matrix.view(), measurements);
    loadings_from_cov_matrix(&cov, normalization)
}

fn loadings_from_cov_matrix(
    cov: &CovMatrix,
    normalization: &Normalization,
) -> Result<NamedValues, LoadingsError> {
    let norm_name = normalization.measurement.as_str();
    let norm_idx = cov
        .index_of(norm_name)
        .ok_or_else(|| LoadingsError::UnknownNormalizedMeasurement(norm_name.to_string()))?;
    let mut loadings = NamedValues::new();

    for (i, m) in cov.names.iter().enumerate() {
        if i == norm_idx {
            loadings.push(m.clone(), normalization.value);
            continue;
        }
        let mut estimates = Vec::with_capacity(cov.names.len() - 2);
        for (j, m_prime) in cov.names.iter().enumerate() {
            if j == i || j == norm_idx {
                continue;
            }
            let nominator = normalization.value * cov.values[[i, j]];
            let denominator = cov.values[[norm_idx, j]];
            if denominator == 0.0 || !denominator.is_finite() {
                return Err(LoadingsError::DegenerateCovariance {
                    a: norm_name.to_string(),
                    b: m_prime.clone(),
                });
            }
            if !nominator.is_finite() {
                return Err(LoadingsError::DegenerateCovariance {
                    a: m.clone(),
                    b: m_prime.clone(),
                });
            }
            estimates.push(nominator / denominator);
        }
        let mean = estimates.iter().sum::<f64>() / estimates.len() as f64;
        loadings.push(m.clone(), mean);
    }
    Ok(loadings)
}

/// Measurement intercepts, and the factor mean when one is identified.
///
/// Without an intercept normalization the intercepts are the proxy column
/// means and the factor mean is fixed at zero by convention (returned as
/// `None`). With a normalization, the factor mean is solved from the
/// normalized measurement's mean equation first and the remaining intercepts
/// are adjusted by `loading * factor_mean`.
pub fn intercepts_from_means(
    data: &DataFrame,
    measurements: &[String],
    normalization: Option<&Normalization>,
    loadings: &NamedValues,
) -> Result<(NamedValues, Option<f64>), LoadingsError> {
    let matrix = data::numeric_matrix(data, measurements)?;
    let means = moments::column_means(&matrix.view());

    let Some(norm) = normalization else {
        let intercepts = measurements
            .iter()
            .cloned()
            .zip(means.iter().copied())
            .collect();
        return Ok((intercepts, None));
    };

    let norm_idx = measurements
        .iter()
        .position(|m| m == &norm.measurement)
        .ok_or_else(|| LoadingsError::UnknownNormalizedMeasurement(norm.measurement.clone()))?;
    let norm_loading = loadings
        .get(&norm.measurement)
        .ok_or_else(|| LoadingsError::MissingLoading(norm.measurement.clone()))?;
    if norm_loading == 0.0 {
        return Err(LoadingsError::ZeroLoading(norm.measurement.clone()));
    }
    let factor_mean = (means[norm_idx] - norm.value) / norm_loading;

    let mut intercepts = NamedValues::new();
    for (idx, m) in measurements.iter().enumerate() {
        if m == &norm.measurement {
            intercepts.push(m.clone(), norm.value);
        } else {
            let loading = loadings
                .get(m)
                .ok_or_else(|| LoadingsError::MissingLoading(m.clone()))?;
            intercepts.push(m.clone(), means[idx] - loading * factor_mean);
        }
    }
    Ok((intercepts, Some(factor_mean)))
}

/// Loadings, intercepts, and factor means for all factors in the initial
/// period.
#[derive(Debug, Clone)]
pub struct InitialCoeffs {
    /// Loadings of every measurement, grouped in sorted-factor order.
    pub loadings: NamedValues,
    /// Intercepts of every measurement, grouped in sorted-factor order.
    pub intercepts: NamedValues,
    /// One entry per factor in sorted-factor order; `None` when the factor
    /// mean is fixed at zero rather than estimated.
    pub factor_means: Vec<(String, Option<f64>)>,
}

/// Runs the covariance-ratio and mean-based estimators for every factor of a
/// validated model specification against initial-period data.
///
/// `data` must already be sliced to the initial period (see
/// [`crate::data::period_slice`]). Factors are processed in parallel; the
/// assembled outputs follow sorted-factor order regardless.
pub fn initial_measurement_coeffs(
    data: &DataFrame,
    spec: &ModelSpec,
) -> Result<InitialCoeffs, LoadingsError> {
    spec.validate()?;
    let factors = spec.sorted_factors();
    log::info!(
        "estimating initial-period measurement coefficients for {} factors",
        factors.len()
    );

    let per_factor: Vec<(NamedValues, NamedValues, Option<f64>)> = factors
        .par_iter()
        .map(|factor| {
            let meas_list = factor
                .measurements
                .first()
                .ok_or_else(|| LoadingsError::NoInitialPeriod(factor.name.clone()))?;
            let load_norm = factor
                .loading_normalization(0)
                .ok_or_else(|| LoadingsError::MissingLoadingNormalization(factor.name.clone()))?;
            let loadings = loadings_from_covs(data, meas_list, load_norm)?;
            let (intercepts, factor_mean) = intercepts_from_means(
                data,
                meas_list,
                factor.intercept_normalization(0),
                &loadings,
            )?;
            Ok((loadings, intercepts, factor_mean))
        })
        .collect::<Result<_, LoadingsError>>()?;

    let mut all_loadings = NamedValues::new();
    let mut all_intercepts = NamedValues::new();
    let mut factor_means = Vec::with_capacity(factors.len());
    for (factor, (loadings, intercepts, factor_mean)) in factors.iter().zip(per_factor) {
        for (name, value) in loadings.iter() {
            all_loadings.push(name, value);
        }
        for (name, value) in intercepts.iter() {
            all_intercepts.push(name, value);
        }
        factor_means.push((factor.name.clone(), factor_mean));
    }

    Ok(InitialCoeffs {
        loadings: all_loadings,
        intercepts: all_intercepts,
        factor_means,
    })
}
