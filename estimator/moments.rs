//! # Sample Moments
//!
//! NaN-aware means and pairwise-complete sample covariances over named column
//! matrices. Every cell of the covariance matrix uses exactly the rows where
//! both of its columns are observed (with means recomputed over those rows),
//! so partially missing panels still contribute to identification. The
//! divisor is `n - 1`.

use ndarray::{Array1, Array2, ArrayView2};

/// An insertion-ordered name-to-value mapping.
///
/// Used for loadings, intercepts, and measurement-error variances. Entry
/// order equals the order in which measurements were supplied, which keeps
/// results reproducible; lookup is a linear scan since measurement lists are
/// short.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedValues {
    names: Vec<String>,
    values: Vec<f64>,
}

impl NamedValues {
    pub fn new() -> Self {
        NamedValues {
            names: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: f64) {
        self.names.push(name.into());
        self.values.push(value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        let idx = self.names.iter().position(|n| n == name)?;
        Some(self.values[idx])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.names
            .iter()
            .map(|n| n.as_str())
            .zip(self.values.iter().copied())
    }
}

impl Default for NamedValues {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<(String, f64)> for NamedValues {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        let mut out = NamedValues::new();
        for (name, value) in iter {
            out.push(name, value);
        }
        out
    }
}

/// A square, symmetric covariance matrix over named measurements.
///
/// A finite-sample estimate: symmetry holds by construction but positive
/// semi-definiteness does not, so consumers that invert it must tolerate
/// near-singularity.
#[derive(Debug, Clone)]
pub struct CovMatrix {
    pub names: Vec<String>,
    /// Shape `[names.len(), names.len()]`.
    pub values: Array2<f64>,
}

impl CovMatrix {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.index_of(a)?;
        let j = self.index_of(b)?;
        Some(self.values[[i, j]])
    }
}

/// Column means over the observed (finite) entries of each column.
///
/// A column with no observed entries yields NaN.
pub fn column_means(data: &ArrayView2<f64>) -> Array1<f64> {
    let mut means = Array1::<f64>::zeros(data.ncols());
    for (j, column) in data.columns().into_iter().enumerate() {
        let mut sum = 0.0;
        let mut count = 0usize;
        for &v in column.iter() {
            if v.is_finite() {
                sum += v;
                count += 1;
            }
        }
        means[j] = if count > 0 { sum / count as f64 } else { f64::NAN };
    }
    means
}

/// Pairwise-complete sample covariance matrix of the columns of `data`.
///
/// `names` labels the columns and must match `data.ncols()`. A cell with
/// fewer than two complete observations is NaN.
pub fn pairwise_covariance(data: &ArrayView2<f64>, names: &[String]) -> CovMatrix {
    assert_eq!(
        names.len(),
        data.ncols(),
        "one name per data column is required"
    );
    let m = data.ncols();
    let mut cov = Array2::<f64>::zeros((m, m));
    for j in 0..m {
        for k in j..m {
            let value = pairwise_cell(data, j, k);
            cov[[j, k]] = value;
            cov[[k, j]] = value;
        }
    }
    CovMatrix {
        names: names.to_vec(),
        values: cov,
    }
}

fn pairwise_cell(data: &ArrayView2<f64>, j: usize, k: usize) -> f64 {
    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    let mut count = 0usize;
    for i in 0..data.nrows() {
        let a = data[[i, j]];
        let b = data[[i, k]];
        if a.is_finite() && b.is_finite() {
            sum_a += a;
            sum_b += b;
            count += 1;
        }
    }
    if count < 2 {
        return f64::NAN;
    }
    let mean_a = sum_a / count as f64;
    let mean_b = sum_b / count as f64;
    let mut acc = 0.0;
    for i in 0..data.nrows() {
        let a = data[[i, j]];
        let b = data[[i, k]];
        if a.is_finite() && b.is_finite() {
            acc += (a - mean_a) * (b - mean_b);
        }
    }
    acc / (count - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn covariance_matches_hand_computation() {
        // var(a) = 5/3, cov(a, b) = 10/3 for b = 2a.
        let data = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0], [4.0, 8.0]];
        let names = vec!["a".to_string(), "b".to_string()];
        let cov = pairwise_covariance(&data.view(), &names);
        assert_abs_diff_eq!(cov.get("a", "a").unwrap(), 5.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov.get("a", "b").unwrap(), 10.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov.get("b", "b").unwrap(), 20.0 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(
            cov.get("b", "a").unwrap(),
            cov.get("a", "b").unwrap(),
            epsilon = 1e-15
        );
    }

    #[test]
    fn covariance_uses_pairwise_complete_rows() {
        // The NaN row is dropped for the (a, b) cell but the (a, a) cell
        // still uses all four observations of a.
        let data = array![
            [1.0, 2.0],
            [2.0, f64::NAN],
            [3.0, 6.0],
            [4.0, 8.0]
        ];
        let names = vec!["a".to_string(), "b".to_string()];
        let cov = pairwise_covariance(&data.view(), &names);
        assert_abs_diff_eq!(cov.get("a", "a").unwrap(), 5.0 / 3.0, epsilon = 1e-12);
        // Complete pairs: (1,2), (3,6), (4,8); cov = 2 * var([1,3,4]).
        let var_abc = {
            let mean: f64 = (1.0 + 3.0 + 4.0) / 3.0;
            ((1.0 - mean).powi(2) + (3.0 - mean).powi(2) + (4.0 - mean).powi(2)) / 2.0
        };
        assert_abs_diff_eq!(cov.get("a", "b").unwrap(), 2.0 * var_abc, epsilon = 1e-12);
    }

    #[test]
    fn covariance_cell_with_too_few_pairs_is_nan() {
        let data = array![[1.0, f64::NAN], [2.0, f64::NAN], [3.0, 1.0]];
        let names = vec!["a".to_string(), "b".to_string()];
        let cov = pairwise_covariance(&data.view(), &names);
        assert!(cov.get("a", "b").unwrap().is_nan());
        assert!(cov.get("b", "b").unwrap().is_nan());
    }

    #[test]
    fn means_skip_missing_entries() {
        let data = array![[1.0, 10.0], [f64::NAN, 20.0], [3.0, 30.0]];
        let means = column_means(&data.view());
        assert_abs_diff_eq!(means[0], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(means[1], 20.0, epsilon = 1e-12);
    }

    #[test]
    fn named_values_preserve_insertion_order() {
        let mut values = NamedValues::new();
        values.push("z", 1.0);
        values.push("a", 2.0);
        assert_eq!(values.names(), &["z".to_string(), "a".to_string()]);
        assert_abs_diff_eq!(values.get("a").unwrap(), 2.0);
        assert!(values.get("missing").is_none());
    }
}
