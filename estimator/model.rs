//! # Model Specification
//!
//! Declarative description of the latent-factor model handed in by the
//! orchestration layer: which measurements belong to which factor in which
//! period, and which loading/intercept normalizations pin down each factor's
//! scale and location. The structs are serde-enabled so an outer layer can
//! load them from TOML or JSON.
//!
//! Normalization bookkeeping is validated eagerly here, at configuration
//! time, so estimators never discover a conflict halfway through a pass.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Which coefficient a normalization fixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizationKind {
    Loading,
    Intercept,
}

impl fmt::Display for NormalizationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormalizationKind::Loading => write!(f, "loading"),
            NormalizationKind::Intercept => write!(f, "intercept"),
        }
    }
}

/// Fixes one measurement's loading or intercept to a known value, resolving
/// the scale/location indeterminacy of a latent factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub measurement: String,
    pub value: f64,
}

impl Normalization {
    pub fn new(measurement: impl Into<String>, value: f64) -> Self {
        Normalization {
            measurement: measurement.into(),
            value,
        }
    }
}

/// One latent factor: its measurement lists and normalizations, per period.
///
/// The normalization vectors hold one (possibly empty) list per period so a
/// deserialized configuration can be checked for the at-most-one invariant
/// instead of silently dropping entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorSpec {
    pub name: String,
    /// One sublist of measurement (column) names per period.
    pub measurements: Vec<Vec<String>>,
    /// At most one entry per period; enforced by [`ModelSpec::validate`].
    #[serde(default)]
    pub loading_normalizations: Vec<Vec<Normalization>>,
    /// At most one entry per period; enforced by [`ModelSpec::validate`].
    #[serde(default)]
    pub intercept_normalizations: Vec<Vec<Normalization>>,
}

impl FactorSpec {
    pub fn num_periods(&self) -> usize {
        self.measurements.len()
    }

    /// The loading normalization for `period`, if one was supplied.
    pub fn loading_normalization(&self, period: usize) -> Option<&Normalization> {
        self.loading_normalizations.get(period).and_then(|v| v.first())
    }

    /// The intercept normalization for `period`, if one was supplied.
    pub fn intercept_normalization(&self, period: usize) -> Option<&Normalization> {
        self.intercept_normalizations
            .get(period)
            .and_then(|v| v.first())
    }
}

/// The full model specification across factors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub factors: Vec<FactorSpec>,
}

/// Violations of the model specification invariants.
#[derive(Error, Debug, PartialEq)]
pub enum SpecError {
    #[error("factor name '{0}' appears more than once in the model specification")]
    DuplicateFactor(String),
    #[error("factor '{factor}' has no measurements in period {period}")]
    NoMeasurements { factor: String, period: usize },
    #[error(
        "measurement column '{measurement}' is claimed by more than one factor in period {period}"
    )]
    DuplicateMeasurement { measurement: String, period: usize },
    #[error(
        "factor '{factor}' has {found} {kind} normalizations in period {period}; at most one is allowed"
    )]
    DuplicateNormalization {
        factor: String,
        period: usize,
        kind: NormalizationKind,
        found: usize,
    },
    #[error(
        "the {kind} normalization for factor '{factor}' in period {period} references '{measurement}', which is not one of the factor's measurements in that period"
    )]
    UnknownMeasurement {
        factor: String,
        period: usize,
        kind: NormalizationKind,
        measurement: String,
    },
}

impl ModelSpec {
    /// Checks every specification invariant eagerly.
    ///
    /// Estimators assume a validated spec; calling them with an unvalidated
    /// one risks surfacing the same problems as opaque numeric errors.
    pub fn validate(&self) -> Result<(), SpecError> {
        let mut factor_names = HashSet::new();
        for factor in &self.factors {
            if !factor_names.insert(factor.name.as_str()) {
                return Err(SpecError::DuplicateFactor(factor.name.clone()));
            }
        }

        let num_periods = self
            .factors
            .iter()
            .map(FactorSpec::num_periods)
            .max()
            .unwrap_or(0);
        for period in 0..num_periods {
            let mut claimed = HashSet::new();
            for factor in &self.factors {
                let Some(meas_list) = factor.measurements.get(period) else {
                    continue;
                };
                if meas_list.is_empty() {
                    return Err(SpecError::NoMeasurements {
                        factor: factor.name.clone(),
                        period,
                    });
                }
                for measurement in meas_list {
                    if !claimed.insert(measurement.as_str()) {
                        return Err(SpecError::DuplicateMeasurement {
                            measurement: measurement.clone(),
                            period,
                        });
                    }
                }
                validate_normalizations(
                    factor,
                    period,
                    NormalizationKind::Loading,
                    &factor.loading_normalizations,
                    meas_list,
                )?;
                validate_normalizations(
                    factor,
                    period,
                    NormalizationKind::Intercept,
                    &factor.intercept_normalizations,
                    meas_list,
                )?;
            }
        }
        Ok(())
    }

    /// Factors in sorted-name order, the canonical iteration order for every
    /// per-factor estimate and for the flattened factor-covariance output.
    pub fn sorted_factors(&self) -> Vec<&FactorSpec> {
        let mut factors: Vec<&FactorSpec> = self.factors.iter().collect();
        factors.sort_by(|a, b| a.name.cmp(&b.name));
        factors
    }
}

fn validate_normalizations(
    factor: &FactorSpec,
    period: usize,
    kind: NormalizationKind,
    normalizations: &[Vec<Normalization>],
    measurements: &[String],
) -> Result<(), SpecError> {
    let Some(period_norms) = normalizations.get(period) else {
        return Ok(());
    };
    if period_norms.len() > 1 {
        return Err(SpecError::DuplicateNormalization {
            factor: factor.name.clone(),
            period,
            kind,
            found: period_norms.len(),
        });
    }
    if let Some(norm) = period_norms.first() {
        if !measurements.contains(&norm.measurement) {
            return Err(SpecError::UnknownMeasurement {
                factor: factor.name.clone(),
                period,
                kind,
                measurement: norm.measurement.clone(),
            });
        }
    }
    Ok(())
}
