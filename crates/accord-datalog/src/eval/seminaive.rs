//! Stratified semi-naive evaluation.

use std::collections::HashSet;

use tracing::trace;

use super::{
    DEFAULT_MAX_ITERATIONS, DerivedTables, Evaluator, Frame, Inputs, TableSource, empty_tables,
    fire, merge, rules_for,
};
use crate::builtins::BuiltinRegistry;
use crate::error::DatalogError;
use crate::program::{Program, Source, Step};

/// Default strategy for recursive policies.
///
/// Strata are evaluated lowest first. Within a recursive stratum, each round
/// re-fires a rule once per recursive literal, with that literal restricted
/// to the rows derived in the previous round.
#[derive(Debug, Clone)]
pub struct SemiNaiveEvaluator {
    max_iterations: usize,
}

impl SemiNaiveEvaluator {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }
}

impl Default for SemiNaiveEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

impl Evaluator for SemiNaiveEvaluator {
    fn name(&self) -> &'static str {
        "semi-naive"
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
            let mut delta = merge(&mut derived, candidates);

            if !stratum.recursive {
                continue;
            }

            let mut iterations = 0;
            while !delta.is_empty() {
                iterations += 1;
                if iterations > self.max_iterations {
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
                        for (index, step) in rule.steps.iter().enumerate() {
                            let Step::Scan {
                                source: Source::Local(name),
                                negated: false,
                                ..
                            } = step
                            else {
                                continue;
                            };
                            let Some(rows) = delta.get(name) else {
                                continue;
                            };
                            let out: &mut HashSet<_> =
                                candidates.entry(rule.head_table.clone()).or_default();
                            fire(rule, &frame, Some((index, rows)), out)?;
                        }
                    }
                }
                delta = merge(&mut derived, candidates);
            }

            trace!(
                policy = program.policy(),
                tables = ?stratum.tables,
                iterations,
                "stratum converged"
            );
        }

        Ok(derived)
    }
}
