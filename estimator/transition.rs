//! # Transition Formula Registry
//!
//! The IV engine does not know anything about transition functional forms; it
//! asks a [`FormulaExpansion`] to turn raw regressor and instrument column
//! names into concrete design specifications. Expansions are registered under
//! a transition-kind identifier once, at configuration time, and looked up by
//! tag; a request for an unregistered kind is an `UnknownTransition` error,
//! never a dynamic-dispatch surprise deep inside the estimator.
//!
//! A [`FormulaSpec`] is a fixed, ordered list of linear-in-parameters terms.
//! Given the same inputs it always materializes the same design matrix with
//! the same column order (the explicit constant column comes last), which is
//! what makes beta vectors comparable across calls.

use crate::data::ColumnBlock;
use itertools::Itertools;
use ndarray::{Array1, Array2, Axis};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("no formula expansion is registered for transition kind '{0}'")]
    UnknownTransition(String),
    #[error("formula term references column '{0}', which is not in the assembled block")]
    UnknownColumn(String),
}

/// One column of a design matrix. Non-linear in variables, linear in
/// parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// A raw data column.
    Raw(String),
    /// The square of a data column.
    Square(String),
    /// The elementwise product of two data columns.
    Interaction(String, String),
    /// The explicit constant column.
    Constant,
}

impl Term {
    fn label(&self) -> String {
        match self {
            Term::Raw(name) => name.clone(),
            Term::Square(name) => format!("{name}_squared"),
            Term::Interaction(a, b) => format!("{a}:{b}"),
            Term::Constant => "constant".to_string(),
        }
    }
}

/// An ordered design specification that deterministically materializes a
/// matrix from a named column block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaSpec {
    terms: Vec<Term>,
}

impl FormulaSpec {
    pub fn new(terms: Vec<Term>) -> Self {
        FormulaSpec { terms }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Human-readable labels in design-matrix column order.
    pub fn column_labels(&self) -> Vec<String> {
        self.terms.iter().map(Term::label).collect()
    }

    pub fn num_columns(&self) -> usize {
        self.terms.len()
    }

    /// Builds the design matrix, one column per term, rows aligned with the
    /// block's rows.
    pub fn build(&self, block: &ColumnBlock) -> Result<Array2<f64>, TransitionError> {
        let n = block.nrows();
        let mut design = Array2::<f64>::zeros((n, self.terms.len()));
        for (j, term) in self.terms.iter().enumerate() {
            let column: Array1<f64> = match term {
                Term::Raw(name) => lookup(block, name)?.to_owned(),
                Term::Square(name) => {
                    let c = lookup(block, name)?;
                    &c * &c
                }
                Term::Interaction(a, b) => {
                    let ca = lookup(block, a)?;
                    let cb = lookup(block, b)?;
                    &ca * &cb
                }
                Term::Constant => Array1::ones(n),
            };
            design.index_axis_mut(Axis(1), j).assign(&column);
        }
        Ok(design)
    }
}

fn lookup<'a>(
    block: &'a ColumnBlock,
    name: &str,
) -> Result<ndarray::ArrayView1<'a, f64>, TransitionError> {
    block
        .column(name)
        .ok_or_else(|| TransitionError::UnknownColumn(name.to_string()))
}

/// Expands regressor names and instrument name groups into design
/// specifications for one transition functional form.
///
/// Implementations must be deterministic: the same inputs always yield the
/// same terms in the same order.
pub trait FormulaExpansion: Send + Sync {
    fn expand(
        &self,
        indepvars: &[String],
        instrument_groups: &[Vec<String>],
    ) -> (FormulaSpec, FormulaSpec);
}

/// Plain linear transition: raw regressors, flattened instruments, constant.
pub struct Linear;

impl FormulaExpansion for Linear {
    fn expand(
        &self,
        indepvars: &[String],
        instrument_groups: &[Vec<String>],
    ) -> (FormulaSpec, FormulaSpec) {
        let mut indep_terms: Vec<Term> =
            indepvars.iter().cloned().map(Term::Raw).collect();
        indep_terms.push(Term::Constant);

        let mut instr_terms: Vec<Term> = instrument_groups
            .iter()
            .flatten()
            .cloned()
            .map(Term::Raw)
            .collect();
        instr_terms.push(Term::Constant);

        (FormulaSpec::new(indep_terms), FormulaSpec::new(instr_terms))
    }
}

/// Translog transition: raw regressors plus squares and pairwise
/// interactions.
///
/// The instrument side mirrors that structure group-wise: flattened raw
/// instruments; within each group, distinct pairwise products (or the square
/// when the group has a single member) standing in for the regressor square;
/// and cross-group products standing in for each regressor interaction. With
/// single-member groups this yields exactly as many instruments as
/// regressors.
pub struct Translog;

impl FormulaExpansion for Translog {
    fn expand(
        &self,
        indepvars: &[String],
        instrument_groups: &[Vec<String>],
    ) -> (FormulaSpec, FormulaSpec) {
        let mut indep_terms: Vec<Term> =
            indepvars.iter().cloned().map(Term::Raw).collect();
        for name in indepvars {
            indep_terms.push(Term::Square(name.clone()));
        }
        for (a, b) in indepvars.iter().tuple_combinations() {
            indep_terms.push(Term::Interaction(a.clone(), b.clone()));
        }
        indep_terms.push(Term::Constant);

        let mut instr_terms: Vec<Term> = instrument_groups
            .iter()
            .flatten()
            .cloned()
            .map(Term::Raw)
            .collect();
        for group in instrument_groups {
            if group.len() == 1 {
                instr_terms.push(Term::Square(group[0].clone()));
            } else {
                for (a, b) in group.iter().tuple_combinations() {
                    instr_terms.push(Term::Interaction(a.clone(), b.clone()));
                }
            }
        }
        for (group_a, group_b) in instrument_groups.iter().tuple_combinations() {
            for a in group_a {
                for b in group_b {
                    instr_terms.push(Term::Interaction(a.clone(), b.clone()));
                }
            }
        }
        instr_terms.push(Term::Constant);

        (FormulaSpec::new(indep_terms), FormulaSpec::new(instr_terms))
    }
}

/// Maps transition-kind identifiers to formula expansions.
///
/// Built once at configuration time; the IV engine only ever reads it.
pub struct TransitionRegistry {
    expansions: HashMap<String, Box<dyn FormulaExpansion>>,
}

impl TransitionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        TransitionRegistry {
            expansions: HashMap::new(),
        }
    }

    /// A registry with the built-in `linear` and `translog` expansions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("linear", Box::new(Linear));
        registry.register("translog", Box::new(Translog));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, expansion: Box<dyn FormulaExpansion>) {
        self.expansions.insert(kind.into(), expansion);
    }

    pub fn expand(
        &self,
        kind: &str,
        indepvars: &[String],
        instrument_groups: &[Vec<String>],
    ) -> Result<(FormulaSpec, FormulaSpec), TransitionError> {
        let expansion = self
            .expansions
            .get(kind)
            .ok_or_else(|| TransitionError::UnknownTransition(kind.to_string()))?;
        Ok(expansion.expand(indepvars, instrument_groups))
    }
}

impl Default for TransitionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn unknown_transition_kind_is_an_error() {
        let registry = TransitionRegistry::with_builtins();
        let err = registry
            .expand("log_ces", &names(&["x1"]), &[names(&["z1"])])
            .unwrap_err();
        match err {
            TransitionError::UnknownTransition(kind) => assert_eq!(kind, "log_ces"),
            other => panic!("expected UnknownTransition, got {other:?}"),
        }
    }

    #[test]
    fn custom_expansions_can_be_registered() {
        struct Identity;
        impl FormulaExpansion for Identity {
            fn expand(
                &self,
                indepvars: &[String],
                _instrument_groups: &[Vec<String>],
            ) -> (FormulaSpec, FormulaSpec) {
                let terms: Vec<Term> = indepvars.iter().cloned().map(Term::Raw).collect();
                (FormulaSpec::new(terms.clone()), FormulaSpec::new(terms))
            }
        }
        let mut registry = TransitionRegistry::new();
        registry.register("identity", Box::new(Identity));
        let (indep, instr) = registry
            .expand("identity", &names(&["x1"]), &[])
            .unwrap();
        assert_eq!(indep.column_labels(), vec!["x1"]);
        assert_eq!(instr.column_labels(), vec!["x1"]);
    }

    #[test]
    fn linear_expansion_appends_constant_last() {
        let registry = TransitionRegistry::with_builtins();
        let (indep, instr) = registry
            .expand(
                "linear",
                &names(&["x1", "x2"]),
                &[names(&["z1a", "z1b"]), names(&["z2"])],
            )
            .unwrap();
        assert_eq!(indep.column_labels(), vec!["x1", "x2", "constant"]);
        assert_eq!(
            instr.column_labels(),
            vec!["z1a", "z1b", "z2", "constant"]
        );
    }

    #[test]
    fn translog_expansion_orders_squares_then_interactions() {
        let registry = TransitionRegistry::with_builtins();
        let (indep, instr) = registry
            .expand(
                "translog",
                &names(&["x1", "x2"]),
                &[names(&["z1"]), names(&["z2"])],
            )
            .unwrap();
        assert_eq!(
            indep.column_labels(),
            vec!["x1", "x2", "x1_squared", "x2_squared", "x1:x2", "constant"]
        );
        // Single-member groups: same column count as the regressor design.
        assert_eq!(
            instr.column_labels(),
            vec!["z1", "z2", "z1_squared", "z2_squared", "z1:z2", "constant"]
        );
        assert_eq!(instr.num_columns(), indep.num_columns());
    }

    #[test]
    fn build_materializes_squares_and_interactions() {
        let block = ColumnBlock {
            names: names(&["x1", "x2"]),
            values: array![[1.0, 2.0], [3.0, 4.0]],
        };
        let spec = FormulaSpec::new(vec![
            Term::Raw("x1".to_string()),
            Term::Square("x2".to_string()),
            Term::Interaction("x1".to_string(), "x2".to_string()),
            Term::Constant,
        ]);
        let design = spec.build(&block).unwrap();
        assert_eq!(design.shape(), &[2, 4]);
        assert_abs_diff_eq!(design[[0, 0]], 1.0);
        assert_abs_diff_eq!(design[[1, 1]], 16.0);
        assert_abs_diff_eq!(design[[1, 2]], 12.0);
        assert_abs_diff_eq!(design[[0, 3]], 1.0);
        assert_abs_diff_eq!(design[[1, 3]], 1.0);
    }

    #[test]
    fn build_reports_missing_columns() {
        let block = ColumnBlock {
            names: names(&["x1"]),
            values: array![[1.0], [2.0]],
        };
        let spec = FormulaSpec::new(vec![Term::Raw("x7".to_string())]);
        let err = spec.build(&block).unwrap_err();
        match err {
            TransitionError::UnknownColumn(name) => assert_eq!(name, "x7"),
            other => panic!("expected UnknownColumn, got {other:?}"),
        }
    }
}
