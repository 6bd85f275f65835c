//! Naive re-evaluation with an explicit builtin capability set.

use std::collections::BTreeSet;

use super::{
    DEFAULT_MAX_ITERATIONS, DerivedTables, Evaluator, Frame, Inputs, TableSource, empty_tables,
    fire, merge, rules_for,
};
use crate::builtins::{Builtin, BuiltinClass, BuiltinRegistry};
use crate::error::DatalogError;
use crate::program::Program;

/// Re-fires every rule of a stratum against the full tables until a round
/// adds nothing.
///
/// Produces the same tables as [`super::SemiNaiveEvaluator`] for every rule
/// set it accepts. Which builtin classes it accepts is configurable and
/// queryable through [`NaiveEvaluator::classes`].
#[derive(Debug, Clone)]
pub struct NaiveEvaluator {
    classes: BTreeSet<BuiltinClass>,
    max_iterations: usize,
}

impl NaiveEvaluator {
    pub fn new(classes: impl IntoIterator<Item = BuiltinClass>, max_iterations: usize) -> Self {
        Self {
            classes: classes.into_iter().collect(),
            max_iterations,
        }
    }

    /// Arithmetic, bitwise and comparison builtins only.
    pub fn numeric() -> Self {
        Self::new(
            [
                BuiltinClass::Arithmetic,
                BuiltinClass::Bitwise,
                BuiltinClass::Comparison,
            ],
            DEFAULT_MAX_ITERATIONS,
        )
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn classes(&self) -> &BTreeSet<BuiltinClass> {
        &self.classes
    }
}

impl Default for NaiveEvaluator {
    fn default() -> Self {
        Self::new(
            [
                BuiltinClass::Arithmetic,
                BuiltinClass::Bitwise,
                BuiltinClass::Comparison,
                BuiltinClass::String,
            ],
            DEFAULT_MAX_ITERATIONS,
        )
    }
}

impl Evaluator for NaiveEvaluator {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn supports_builtin(&self, builtin: &Builtin) -> bool {
        self.classes.contains(&builtin.class())
    }

    fn evaluate(
        &self,
        program: &Program,
        source: &dyn TableSource,
        builtins: &BuiltinRegistry,
    ) -> Result<DerivedTables, DatalogError> {
        let inputs = Inputs::load(program, source);
        let mut derived = empty_tables(program);

        for stratum in &program.stratification().strata {
            let rules = rules_for(program, &stratum.tables);
            let mut rounds = 0;
            loop {
                rounds += 1;
                if rounds > self.max_iterations {
                    return Err(DatalogError::Evaluation(format!(
                        "no fixpoint for {:?} after {} iterations",
                        stratum.tables, self.max_iterations
                    )));
                }

                let mut candidates = DerivedTables::new();
                {
                    let frame = Frame {
                        policy: program.policy(),
                        inputs: &inputs,
                        local: &derived,
                        builtins,
                    };
                    for rule in &rules {
                        let out = candidates.entry(rule.head_table.clone()).or_default();
                        fire(rule, &frame, None, out)?;
                    }
                }
                if merge(&mut derived, candidates).is_empty() {
                    break;
                }
            }
        }

        Ok(derived)
    }
}
