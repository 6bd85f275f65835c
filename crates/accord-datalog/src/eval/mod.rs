//! Fixpoint evaluation.
//!
//! Every strategy evaluates a [`Program`] against a consistent snapshot of
//! the external tables it reads and returns the full contents of each of the
//! policy's derived tables. Strategies differ in how they reach the fixpoint
//! and in which rule sets and builtins they accept:
//!
//! - [`SemiNaiveEvaluator`]: stratified, each round joins only last round's
//!   new rows into recursive literals
//! - [`NonrecursiveEvaluator`]: a single pass in dependency order
//! - [`NaiveEvaluator`]: re-evaluates every rule until nothing changes, with a
//!   declared builtin capability set

mod naive;
mod nonrecursive;
mod seminaive;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{trace, warn};

use crate::builtins::{Builtin, BuiltinError, BuiltinRegistry, Outcome};
use crate::error::DatalogError;
use crate::program::{CompiledRule, PreparedRule, Program, Slot, Source, Step, Stratification};
use crate::value::{Row, TableId, Value};

pub use naive::NaiveEvaluator;
pub use nonrecursive::NonrecursiveEvaluator;
pub use seminaive::SemiNaiveEvaluator;

/// Default bound on fixpoint iterations within one stratum.
pub const DEFAULT_MAX_ITERATIONS: usize = 10_000;

/// Contents of every derived table of a policy, keyed by table name.
pub type DerivedTables = BTreeMap<String, HashSet<Row>>;

/// Read access to tables owned by datasources and other policies.
pub trait TableSource {
    fn rows(&self, table: &TableId) -> Option<Arc<HashSet<Row>>>;
}

/// A fixpoint strategy.
pub trait Evaluator: Send + Sync {
    /// Short name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Whether rules of this strategy may invoke `builtin`.
    fn supports_builtin(&self, _builtin: &Builtin) -> bool {
        true
    }

    /// Reject a stratification this strategy cannot evaluate.
    fn check(&self, _policy: &str, _stratification: &Stratification) -> Result<(), DatalogError> {
        Ok(())
    }

    /// Check a rule before it is added to a policy using this strategy.
    fn check_rule(
        &self,
        policy: &str,
        prepared: &PreparedRule,
        builtins: &BuiltinRegistry,
    ) -> Result<(), DatalogError> {
        for name in &prepared.builtins {
            if let Some(builtin) = builtins.get(name)
                && !self.supports_builtin(builtin)
            {
                return Err(DatalogError::UnsupportedBuiltin {
                    builtin: name.clone(),
                    engine: self.name().to_string(),
                });
            }
        }
        self.check(policy, &prepared.stratification)
    }

    /// Compute the derived tables of `program`.
    fn evaluate(
        &self,
        program: &Program,
        source: &dyn TableSource,
        builtins: &BuiltinRegistry,
    ) -> Result<DerivedTables, DatalogError>;
}

/// Snapshot of the external tables a program reads, taken once per
/// evaluation.
pub(crate) struct Inputs {
    external: HashMap<TableId, Arc<HashSet<Row>>>,
}

impl Inputs {
    pub(crate) fn load(program: &Program, source: &dyn TableSource) -> Self {
        let external = program
            .references()
            .into_iter()
            .filter_map(|id| source.rows(&id).map(|rows| (id, rows)))
            .collect();
        Self { external }
    }
}

/// Everything a rule firing reads.
pub(crate) struct Frame<'a> {
    pub(crate) policy: &'a str,
    pub(crate) inputs: &'a Inputs,
    pub(crate) local: &'a DerivedTables,
    pub(crate) builtins: &'a BuiltinRegistry,
}

impl Frame<'_> {
    fn rows(&self, source: &Source) -> Option<&HashSet<Row>> {
        match source {
            Source::Local(name) => self.local.get(name),
            Source::External(id) => self.inputs.external.get(id).map(|rows| rows.as_ref()),
        }
    }
}

type Binding = Vec<Option<Value>>;

/// Derived tables of `program`, all present and empty.
pub(crate) fn empty_tables(program: &Program) -> DerivedTables {
    program
        .derived_tables()
        .into_keys()
        .map(|name| (name, HashSet::new()))
        .collect()
}

/// Rules whose head belongs to one of `tables`.
pub(crate) fn rules_for<'p>(program: &'p Program, tables: &[String]) -> Vec<&'p CompiledRule> {
    program
        .rules()
        .iter()
        .map(|r| &r.compiled)
        .filter(|r| tables.contains(&r.head_table))
        .collect()
}

/// Merge `candidates` into `derived`, returning only the rows that were new.
pub(crate) fn merge(derived: &mut DerivedTables, candidates: DerivedTables) -> DerivedTables {
    let mut added = DerivedTables::new();
    for (table, rows) in candidates {
        let existing = derived.entry(table.clone()).or_default();
        let fresh: HashSet<Row> = rows.into_iter().filter(|row| existing.insert(row.clone())).collect();
        if !fresh.is_empty() {
            added.insert(table, fresh);
        }
    }
    added
}

/// Evaluate one rule, adding every head row it derives to `out`.
///
/// With `delta = Some((i, rows))`, step `i` scans `rows` instead of its
/// table.
pub(crate) fn fire(
    rule: &CompiledRule,
    frame: &Frame<'_>,
    delta: Option<(usize, &HashSet<Row>)>,
    out: &mut HashSet<Row>,
) -> Result<(), DatalogError> {
    let mut bindings: Vec<Binding> = vec![vec![None; rule.var_count]];

    for (index, step) in rule.steps.iter().enumerate() {
        if bindings.is_empty() {
            return Ok(());
        }

        bindings = match step {
            Step::Scan {
                source,
                args,
                negated,
            } => {
                let rows = match delta {
                    Some((i, rows)) if i == index => Some(rows),
                    _ => frame.rows(source),
                };
                if *negated {
                    bindings.retain(|binding| {
                        !rows.is_some_and(|rows| rows.iter().any(|row| holds(args, row, binding)))
                    });
                    bindings
                } else {
                    let Some(rows) = rows else {
                        return Ok(());
                    };
                    join(&bindings, args, rows)
                }
            }
            Step::Call { builtin, args } => {
                let Some(builtin) = frame.builtins.get(builtin) else {
                    warn!(
                        policy = frame.policy,
                        builtin = %builtin,
                        rule = %rule.head_table,
                        "unknown builtin, rule skipped"
                    );
                    return Ok(());
                };
                call(bindings, builtin, args)?
            }
        };
    }

    for binding in &bindings {
        out.insert(project(&rule.head, binding)?);
    }
    Ok(())
}

fn join(bindings: &[Binding], args: &[Slot], rows: &HashSet<Row>) -> Vec<Binding> {
    let mut joined = Vec::new();
    for binding in bindings {
        joined.extend(rows.iter().filter_map(|row| unify(args, row, binding)));
    }
    joined
}

/// Extend `binding` so that `args` matches `row`.
fn unify(args: &[Slot], row: &Row, binding: &Binding) -> Option<Binding> {
    if row.arity() != args.len() {
        return None;
    }
    let mut next = binding.clone();
    for (slot, value) in args.iter().zip(row.values()) {
        match slot {
            Slot::Ignore => {}
            Slot::Const(constant) => {
                if constant != value {
                    return None;
                }
            }
            Slot::Var(i) => match next.get_mut(*i)? {
                Some(bound) => {
                    if bound != value {
                        return None;
                    }
                }
                unbound @ None => *unbound = Some(value.clone()),
            },
        }
    }
    Some(next)
}

/// Whether `row` matches `args` under a binding that already binds every
/// variable in `args`.
fn holds(args: &[Slot], row: &Row, binding: &Binding) -> bool {
    row.arity() == args.len()
        && args.iter().zip(row.values()).all(|(slot, value)| match slot {
            Slot::Ignore => true,
            Slot::Const(constant) => constant == value,
            Slot::Var(i) => match binding.get(*i) {
                Some(Some(bound)) => bound == value,
                _ => true,
            },
        })
}

fn resolve(slot: &Slot, binding: &Binding) -> Option<Value> {
    match slot {
        Slot::Var(i) => binding.get(*i).cloned().flatten(),
        Slot::Const(value) => Some(value.clone()),
        Slot::Ignore => None,
    }
}

fn call(bindings: Vec<Binding>, builtin: &Builtin, args: &[Slot]) -> Result<Vec<Binding>, DatalogError> {
    if args.len() != builtin.arity() {
        return Err(BuiltinError::Arity {
            name: builtin.name().to_string(),
            expected: builtin.arity(),
            actual: args.len(),
        }
        .into());
    }

    let input_slots = &args[..builtin.input_arity()];
    let mut kept = Vec::with_capacity(bindings.len());

    for mut binding in bindings {
        let inputs = input_slots
            .iter()
            .map(|slot| resolve(slot, &binding))
            .collect::<Option<Vec<Value>>>()
            .ok_or_else(|| {
                DatalogError::Evaluation(format!("unbound input to builtin {}", builtin.name()))
            })?;

        let keep = match builtin.invoke(&inputs) {
            Ok(Outcome::Holds(holds)) => holds,
            Ok(Outcome::Value(value)) => match args.last() {
                Some(Slot::Var(i)) => match binding.get_mut(*i) {
                    Some(Some(bound)) => *bound == value,
                    Some(unbound @ None) => {
                        *unbound = Some(value);
                        true
                    }
                    None => false,
                },
                Some(Slot::Const(constant)) => *constant == value,
                _ => true,
            },
            Err(BuiltinError::Domain { name, reason }) => {
                trace!(builtin = %name, %reason, "binding outside builtin domain");
                false
            }
            Err(e) => return Err(e.into()),
        };

        if keep {
            kept.push(binding);
        }
    }

    Ok(kept)
}

fn project(head: &[Slot], binding: &Binding) -> Result<Row, DatalogError> {
    head.iter()
        .map(|slot| {
            resolve(slot, binding)
                .ok_or_else(|| DatalogError::Evaluation("unbound head variable".to_string()))
        })
        .collect::<Result<Vec<Value>, _>>()
        .map(Row::new)
}
