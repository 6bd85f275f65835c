//! Single-pass evaluation for policies without recursion.

use std::collections::HashSet;

use super::{DerivedTables, Evaluator, Frame, Inputs, TableSource, empty_tables, fire, rules_for};
use crate::builtins::BuiltinRegistry;
use crate::error::DatalogError;
use crate::program::{Program, Stratification};

/// Fires every rule exactly once, producers before consumers.
///
/// Rule sets whose derived tables form a cycle are rejected, both when a
/// rule is added and at evaluation time.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonrecursiveEvaluator;

impl Evaluator for NonrecursiveEvaluator {
    fn name(&self) -> &'static str {
        "nonrecursive"
    }

    fn check(&self, policy: &str, stratification: &Stratification) -> Result<(), DatalogError> {
        match stratification.recursive().next() {
            Some(stratum) => Err(DatalogError::Recursion {
                policy: policy.to_string(),
                tables: stratum.tables.clone(),
            }),
            None => Ok(()),
        }
    }

    fn evaluate(
        &self,
        program: &Program,
        source: &dyn TableSource,
        builtins: &BuiltinRegistry,
    ) -> Result<DerivedTables, DatalogError> {
        self.check(program.policy(), program.stratification())?;

        let inputs = Inputs::load(program, source);
        let mut derived = empty_tables(program);

        for stratum in &program.stratification().strata {
            let mut produced: Vec<(String, HashSet<_>)> = Vec::new();
            {
                let frame = Frame {
                    policy: program.policy(),
                    inputs: &inputs,
                    local: &derived,
                    builtins,
                };
                for rule in rules_for(program, &stratum.tables) {
                    let mut out = HashSet::new();
                    fire(rule, &frame, None, &mut out)?;
                    produced.push((rule.head_table.clone(), out));
                }
            }
            for (table, rows) in produced {
                derived.entry(table).or_default().extend(rows);
            }
        }

        Ok(derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::RuleContext;
    use crate::row;
    use crate::store::Snapshot;
    use crate::value::TableId;

    #[test]
    fn test_chain_in_one_pass() {
        let builtins = BuiltinRegistry::standard();
        let ctx = RuleContext::new(&builtins);
        let mut program = Program::new("p");
        // Added consumer-first; strata still order producers first.
        program.add_rule("c(x) :- b(x)", None, None, &ctx).unwrap();
        program.add_rule("b(x) :- a(x)", None, None, &ctx).unwrap();
        program.add_rule("a(x) :- ds:t(x)", None, None, &ctx).unwrap();

        let mut source = Snapshot::default();
        source.insert(TableId::new("ds", "t"), [row!["v"]]);
        let derived = NonrecursiveEvaluator
            .evaluate(&program, &source, &builtins)
            .unwrap();
        assert_eq!(derived["c"].len(), 1);
    }

    #[test]
    fn test_recursion_rejected() {
        let builtins = BuiltinRegistry::standard();
        let ctx = RuleContext::new(&builtins);
        let mut program = Program::new("p");
        program.add_rule("path(x, y) :- ds:link(x, y)", None, None, &ctx).unwrap();
        let prepared = program
            .prepare("path(x, y) :- ds:link(x, z), path(z, y)", &ctx)
            .unwrap();
        assert!(matches!(
            NonrecursiveEvaluator.check_rule("p", &prepared, &builtins),
            Err(DatalogError::Recursion { .. })
        ));

        program.insert(prepared, None, None);
        assert!(matches!(
            NonrecursiveEvaluator.evaluate(&program, &Snapshot::default(), &builtins),
            Err(DatalogError::Recursion { .. })
        ));
    }
}
