#![deny(dead_code)]
#![deny(unused_imports)]

//! # WA estimator core
//!
//! Moment-based ("weighted average") parameter estimation for linear dynamic
//! latent-factor models. Given a wide panel of noisy proxy measurements for
//! unobserved factors, the crate recovers measurement loadings and intercepts
//! from covariance ratios and proxy means, decomposes measurement covariance
//! matrices into latent factor covariances and measurement-error variances,
//! estimates transition-equation coefficients by one-step or two-step GMM
//! instrumental-variable regression, and recovers transition-shock and
//! anchoring-equation variances from regression residual moments.
//!
//! Everything here is a pure function over immutable inputs; orchestration,
//! configuration files, and dataset simulation belong to outer layers.

pub mod covariance;
pub mod data;
pub mod iv;
pub mod linalg;
pub mod loadings;
pub mod model;
pub mod moments;
pub mod residual;
pub mod transition;
