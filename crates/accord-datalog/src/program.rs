//! Per-policy rule bases.
//!
//! A [`Program`] owns the rules of one policy. Adding a rule parses it,
//! resolves every body literal to a local table, an external table or a
//! builtin, checks arity and safety, compiles it into a sequence of join steps
//! and re-stratifies the policy. Nothing is mutated until every check passes.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use crate::ast::{Atom, BUILTIN_OWNER, Rule, Term};
use crate::builtins::BuiltinRegistry;
use crate::error::DatalogError;
use crate::parser::parse_rule;
use crate::scc::{is_cyclic, strongly_connected};
use crate::schema::TableSchema;
use crate::value::{TableId, Value};

pub type RuleId = Uuid;

/// Where a scan reads its rows from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    /// A table derived by the same policy.
    Local(String),
    /// A table owned by a datasource or another policy.
    External(TableId),
}

/// A compiled argument position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Var(usize),
    Const(Value),
    Ignore,
}

/// One join step. Steps run in order; each extends or filters the bindings
/// produced by the steps before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Scan {
        source: Source,
        args: Vec<Slot>,
        negated: bool,
    },
    Call {
        builtin: String,
        args: Vec<Slot>,
    },
}

/// A rule compiled against variable slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub head_table: String,
    pub head: Vec<Slot>,
    pub steps: Vec<Step>,
    pub var_count: usize,
}

impl CompiledRule {
    /// Local tables read by this rule, with whether the read is negated.
    pub fn local_reads(&self) -> impl Iterator<Item = (&str, bool)> {
        self.steps.iter().filter_map(|step| match step {
            Step::Scan {
                source: Source::Local(name),
                negated,
                ..
            } => Some((name.as_str(), *negated)),
            _ => None,
        })
    }
}

/// A rule stored in a program.
#[derive(Debug, Clone)]
pub struct StoredRule {
    pub id: RuleId,
    pub text: String,
    pub name: Option<String>,
    pub comment: Option<String>,
    pub rule: Rule,
    pub compiled: CompiledRule,
    pub references: BTreeSet<TableId>,
    pub builtins: BTreeSet<String>,
}

/// A group of derived tables evaluated together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stratum {
    pub tables: Vec<String>,
    pub recursive: bool,
}

/// Strata of a policy, lowest first. Every table a stratum reads negatively
/// belongs to an earlier stratum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stratification {
    pub strata: Vec<Stratum>,
}

impl Stratification {
    /// Recursive strata, if any.
    pub fn recursive(&self) -> impl Iterator<Item = &Stratum> {
        self.strata.iter().filter(|s| s.recursive)
    }
}

fn no_schema(_: &TableId) -> Option<TableSchema> {
    None
}

/// What the outside world knows while a rule is being added.
pub struct RuleContext<'a> {
    pub builtins: &'a BuiltinRegistry,
    /// Schema of an existing external table, if known.
    pub schema_of: &'a dyn Fn(&TableId) -> Option<TableSchema>,
}

impl<'a> RuleContext<'a> {
    pub fn new(builtins: &'a BuiltinRegistry) -> Self {
        Self {
            builtins,
            schema_of: &no_schema,
        }
    }

    pub fn with_schemas(mut self, schema_of: &'a dyn Fn(&TableId) -> Option<TableSchema>) -> Self {
        self.schema_of = schema_of;
        self
    }
}

/// A rule that passed every check and can be inserted without failing.
#[derive(Debug, Clone)]
pub struct PreparedRule {
    pub text: String,
    pub rule: Rule,
    pub compiled: CompiledRule,
    /// External tables the rule reads.
    pub references: BTreeSet<TableId>,
    /// Builtins the rule invokes.
    pub builtins: BTreeSet<String>,
    /// Stratification of the policy with this rule added.
    pub stratification: Stratification,
}

/// The rule base of a single policy.
#[derive(Debug, Clone)]
pub struct Program {
    policy: String,
    rules: Vec<StoredRule>,
    stratification: Stratification,
}

impl Program {
    pub fn new(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            rules: Vec::new(),
            stratification: Stratification::default(),
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub fn rules(&self) -> &[StoredRule] {
        &self.rules
    }

    pub fn rule(&self, id: RuleId) -> Option<&StoredRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn stratification(&self) -> &Stratification {
        &self.stratification
    }

    /// Derived tables and their arities.
    pub fn derived_tables(&self) -> BTreeMap<String, usize> {
        self.rules
            .iter()
            .map(|r| (r.compiled.head_table.clone(), r.compiled.head.len()))
            .collect()
    }

    /// External tables read by any rule.
    pub fn references(&self) -> HashSet<TableId> {
        self.rules
            .iter()
            .flat_map(|r| r.references.iter().cloned())
            .collect()
    }

    /// Builtins invoked by any rule.
    pub fn builtins_used(&self) -> BTreeSet<String> {
        self.rules
            .iter()
            .flat_map(|r| r.builtins.iter().cloned())
            .collect()
    }

    /// Parse and check a rule without adding it.
    pub fn prepare(&self, text: &str, ctx: &RuleContext<'_>) -> Result<PreparedRule, DatalogError> {
        let rule = parse_rule(text)?;
        self.prepare_parsed(text, rule, ctx)
    }

    /// Check an already-parsed rule without adding it.
    pub fn prepare_parsed(
        &self,
        text: &str,
        rule: Rule,
        ctx: &RuleContext<'_>,
    ) -> Result<PreparedRule, DatalogError> {
        let canonical = rule.to_string();
        if self.rules.iter().any(|r| r.rule.to_string() == canonical) {
            return Err(DatalogError::DuplicateRule(canonical));
        }

        let head_table = rule.head.table_name();
        // Bare body literals resolve to builtins by name, so a derived table
        // may never take a builtin's name.
        if ctx.builtins.contains(&head_table) {
            return Err(DatalogError::InvalidRule(format!(
                "`{}` is a builtin and cannot be derived",
                head_table
            )));
        }

        let expanded = self.expand_named(&rule, ctx)?;
        let resolved = self.resolve(&expanded, ctx)?;
        self.check_arities(&head_table, &expanded, &resolved, ctx)?;

        let mut references = BTreeSet::new();
        let mut builtins = BTreeSet::new();
        for literal in &resolved {
            match literal {
                Resolved::Scan {
                    source: Source::External(id),
                    ..
                } => {
                    references.insert(id.clone());
                }
                Resolved::Call { name, .. } => {
                    builtins.insert(name.clone());
                }
                Resolved::Scan { .. } => {}
            }
        }

        let compiled = compile(head_table, expanded.head.args(), resolved, ctx.builtins)?;
        let stratification = stratify(
            self.rules
                .iter()
                .map(|r| &r.compiled)
                .chain(std::iter::once(&compiled)),
        )?;

        Ok(PreparedRule {
            text: text.trim().to_string(),
            rule,
            compiled,
            references,
            builtins,
            stratification,
        })
    }

    /// Insert a prepared rule.
    pub fn insert(
        &mut self,
        prepared: PreparedRule,
        name: Option<String>,
        comment: Option<String>,
    ) -> RuleId {
        let id = Uuid::new_v4();
        debug!(policy = %self.policy, rule_id = %id, rule = %prepared.rule, "rule added");
        self.rules.push(StoredRule {
            id,
            text: prepared.text,
            name,
            comment,
            rule: prepared.rule,
            compiled: prepared.compiled,
            references: prepared.references,
            builtins: prepared.builtins,
        });
        self.stratification = prepared.stratification;
        id
    }

    /// Prepare and insert in one step.
    pub fn add_rule(
        &mut self,
        text: &str,
        name: Option<String>,
        comment: Option<String>,
        ctx: &RuleContext<'_>,
    ) -> Result<RuleId, DatalogError> {
        let prepared = self.prepare(text, ctx)?;
        Ok(self.insert(prepared, name, comment))
    }

    /// Remove a rule by id.
    pub fn remove_rule(&mut self, id: RuleId) -> Result<StoredRule, DatalogError> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| DatalogError::RuleNotFound(id.to_string()))?;
        let stratification = stratify(
            self.rules
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, r)| &r.compiled),
        )?;
        let removed = self.rules.remove(index);
        self.stratification = stratification;
        debug!(policy = %self.policy, rule_id = %id, "rule removed");
        Ok(removed)
    }

    /// Rewrite `column=term` arguments into positions, filling the columns
    /// nobody mentions with wildcards.
    fn expand_named(&self, rule: &Rule, ctx: &RuleContext<'_>) -> Result<Rule, DatalogError> {
        let mut expanded = rule.clone();
        for literal in &mut expanded.body {
            let atom = &mut literal.atom;
            if atom.named.is_empty() {
                continue;
            }

            let id = match atom.table.owner.as_deref() {
                Some(owner) if owner != BUILTIN_OWNER && owner != self.policy => {
                    TableId::new(owner, atom.table.name.clone())
                }
                _ => {
                    return Err(DatalogError::InvalidRule(format!(
                        "named arguments need a datasource or policy table, got `{}`",
                        atom.table
                    )));
                }
            };
            let schema = (ctx.schema_of)(&id).ok_or_else(|| {
                DatalogError::InvalidRule(format!("columns of {} are not known yet", id))
            })?;
            if atom.args.len() > schema.arity() {
                return Err(DatalogError::ArityMismatch {
                    table: id.to_string(),
                    expected: schema.arity(),
                    actual: atom.args.len(),
                });
            }

            let positional = atom.args.len();
            atom.args.resize(schema.arity(), Term::Wildcard);
            for (column, term) in std::mem::take(&mut atom.named) {
                let index = schema.index_of(&column).ok_or_else(|| {
                    DatalogError::InvalidRule(format!("{} has no column `{}`", id, column))
                })?;
                if index < positional || atom.args[index] != Term::Wildcard {
                    return Err(DatalogError::InvalidRule(format!(
                        "column `{}` of {} is given twice",
                        column, id
                    )));
                }
                atom.args[index] = term;
            }
        }
        Ok(expanded)
    }

    fn resolve<'r>(
        &self,
        rule: &'r Rule,
        ctx: &RuleContext<'_>,
    ) -> Result<Vec<Resolved<'r>>, DatalogError> {
        let mut resolved = Vec::with_capacity(rule.body.len());

        for literal in &rule.body {
            let atom = &literal.atom;
            let builtin = match atom.table.owner.as_deref() {
                Some(BUILTIN_OWNER) => true,
                None => ctx.builtins.contains(&atom.table.name),
                Some(_) => false,
            };

            if builtin {
                if literal.negated {
                    return Err(DatalogError::InvalidRule(format!(
                        "builtin `{}` cannot be negated",
                        atom.table.name
                    )));
                }
                resolved.push(Resolved::Call {
                    name: atom.table.name.clone(),
                    atom,
                });
                continue;
            }

            let source = match atom.table.owner.as_deref() {
                None => Source::Local(atom.table.name.clone()),
                Some(owner) if owner == self.policy => Source::Local(atom.table.name.clone()),
                Some(owner) => Source::External(TableId::new(owner, atom.table.name.clone())),
            };
            resolved.push(Resolved::Scan {
                source,
                atom,
                negated: literal.negated,
            });
        }

        Ok(resolved)
    }

    fn check_arities(
        &self,
        head_table: &str,
        rule: &Rule,
        resolved: &[Resolved<'_>],
        ctx: &RuleContext<'_>,
    ) -> Result<(), DatalogError> {
        let mut local: HashMap<String, usize> = HashMap::new();
        for stored in &self.rules {
            local.insert(stored.compiled.head_table.clone(), stored.compiled.head.len());
            for step in &stored.compiled.steps {
                if let Step::Scan {
                    source: Source::Local(name),
                    args,
                    ..
                } = step
                {
                    local.entry(name.clone()).or_insert(args.len());
                }
            }
        }

        let mut check_local = |name: &str, actual: usize| -> Result<(), DatalogError> {
            match local.get(name) {
                Some(&expected) if expected != actual => Err(DatalogError::ArityMismatch {
                    table: name.to_string(),
                    expected,
                    actual,
                }),
                Some(_) => Ok(()),
                None => {
                    local.insert(name.to_string(), actual);
                    Ok(())
                }
            }
        };

        check_local(head_table, rule.head.args().len())?;

        for literal in resolved {
            match literal {
                Resolved::Scan {
                    source: Source::Local(name),
                    atom,
                    ..
                } => check_local(name, atom.args.len())?,
                Resolved::Scan {
                    source: Source::External(id),
                    atom,
                    ..
                } => {
                    if let Some(expected) = (ctx.schema_of)(id).map(|s| s.arity())
                        && expected != atom.args.len()
                    {
                        return Err(DatalogError::ArityMismatch {
                            table: id.to_string(),
                            expected,
                            actual: atom.args.len(),
                        });
                    }
                }
                Resolved::Call { name, atom } => {
                    if let Some(builtin) = ctx.builtins.get(name)
                        && builtin.arity() != atom.args.len()
                    {
                        return Err(DatalogError::ArityMismatch {
                            table: format!("{}:{}", BUILTIN_OWNER, name),
                            expected: builtin.arity(),
                            actual: atom.args.len(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

enum Resolved<'r> {
    Scan {
        source: Source,
        atom: &'r Atom,
        negated: bool,
    },
    Call {
        name: String,
        atom: &'r Atom,
    },
}

#[derive(Default)]
struct Compiler<'r> {
    slots: HashMap<&'r str, usize>,
    bound: HashSet<&'r str>,
}

impl<'r> Compiler<'r> {
    fn slot(&mut self, term: &'r Term) -> Slot {
        match term {
            Term::Var(name) => {
                let next = self.slots.len();
                Slot::Var(*self.slots.entry(name.as_str()).or_insert(next))
            }
            Term::Const(value) => Slot::Const(value.clone()),
            Term::Wildcard => Slot::Ignore,
        }
    }

    fn slots(&mut self, terms: &'r [Term]) -> Vec<Slot> {
        terms.iter().map(|t| self.slot(t)).collect()
    }

    fn bind(&mut self, terms: &'r [Term]) {
        for term in terms {
            if let Term::Var(name) = term {
                self.bound.insert(name.as_str());
            }
        }
    }

    /// First term that is not usable as an input.
    fn first_unbound<'t>(&self, terms: &'t [Term], wildcard_ok: bool) -> Option<&'t str> {
        terms.iter().find_map(|term| match term {
            Term::Var(name) if !self.bound.contains(name.as_str()) => Some(name.as_str()),
            Term::Wildcard if !wildcard_ok => Some("_"),
            _ => None,
        })
    }
}

fn compile(
    head_table: String,
    head_args: &[Term],
    resolved: Vec<Resolved<'_>>,
    builtins: &BuiltinRegistry,
) -> Result<CompiledRule, DatalogError> {
    let mut compiler = Compiler::default();
    let mut pending = resolved;
    let mut steps = Vec::with_capacity(pending.len());

    // Inputs the literal needs bound before it can run; `None` for generators.
    let inputs = |literal: &Resolved<'_>| -> Option<(usize, bool)> {
        match literal {
            Resolved::Scan { negated: false, .. } => None,
            Resolved::Scan { atom, .. } => Some((atom.args.len(), true)),
            Resolved::Call { name, atom } => match builtins.get(name) {
                Some(builtin) => Some((builtin.input_arity().min(atom.args.len()), false)),
                None => Some((atom.args.len(), false)),
            },
        }
    };

    while !pending.is_empty() {
        let ready_filter = pending.iter().position(|literal| match (literal, inputs(literal)) {
            (Resolved::Call { name, .. }, _) if !builtins.contains(name) => false,
            (Resolved::Scan { atom, .. }, Some((n, ok)))
            | (Resolved::Call { atom, .. }, Some((n, ok))) => {
                compiler.first_unbound(&atom.args[..n], ok).is_none()
            }
            (_, None) => false,
        });
        let generator = || {
            pending
                .iter()
                .position(|literal| matches!(literal, Resolved::Scan { negated: false, .. }))
        };
        let unknown = || {
            pending
                .iter()
                .position(|literal| matches!(literal, Resolved::Call { name, .. } if !builtins.contains(name)))
        };

        let Some(index) = ready_filter.or_else(generator).or_else(unknown) else {
            let name = pending
                .iter()
                .find_map(|literal| match (literal, inputs(literal)) {
                    (Resolved::Scan { atom, .. }, Some((n, ok)))
                    | (Resolved::Call { atom, .. }, Some((n, ok))) => {
                        compiler.first_unbound(&atom.args[..n], ok)
                    }
                    _ => None,
                })
                .unwrap_or("_");
            return Err(DatalogError::Unsafe(name.to_string()));
        };

        let literal = pending.remove(index);
        let step = match literal {
            Resolved::Scan {
                source,
                atom,
                negated,
            } => {
                let args = compiler.slots(&atom.args);
                if !negated {
                    compiler.bind(&atom.args);
                }
                Step::Scan {
                    source,
                    args,
                    negated,
                }
            }
            Resolved::Call { name, atom } => {
                let args = compiler.slots(&atom.args);
                compiler.bind(&atom.args);
                Step::Call {
                    builtin: name,
                    args,
                }
            }
        };
        steps.push(step);
    }

    let mut head = Vec::with_capacity(head_args.len());
    for term in head_args {
        if let Some(name) = compiler.first_unbound(std::slice::from_ref(term), false) {
            return Err(DatalogError::Unsafe(name.to_string()));
        }
        head.push(compiler.slot(term));
    }

    Ok(CompiledRule {
        head_table,
        head,
        steps,
        var_count: compiler.slots.len(),
    })
}

/// Group derived tables into strata over the local dependency graph.
fn stratify<'c>(rules: impl Iterator<Item = &'c CompiledRule>) -> Result<Stratification, DatalogError> {
    let rules: Vec<&CompiledRule> = rules.collect();
    let heads: BTreeSet<&str> = rules.iter().map(|r| r.head_table.as_str()).collect();

    let mut graph: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut negative: Vec<(&str, &str)> = Vec::new();
    for head in heads.iter().copied() {
        graph.entry(head).or_default();
    }
    for rule in &rules {
        for (read, negated) in rule.local_reads() {
            if !heads.contains(read) {
                continue;
            }
            graph.entry(rule.head_table.as_str()).or_default().insert(read);
            if negated {
                negative.push((rule.head_table.as_str(), read));
            }
        }
    }

    let components = strongly_connected(&graph);
    let mut component_of: HashMap<&str, usize> = HashMap::new();
    for (index, component) in components.iter().enumerate() {
        for table in component.iter().copied() {
            component_of.insert(table, index);
        }
    }

    for (from, to) in negative {
        if component_of.get(from) == component_of.get(to) {
            return Err(DatalogError::Unstratifiable(to.to_string()));
        }
    }

    let strata = components
        .iter()
        .map(|component| Stratum {
            recursive: is_cyclic(component, &graph),
            tables: component.iter().map(|t| t.to_string()).collect(),
        })
        .collect();
    Ok(Stratification { strata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn add(program: &mut Program, text: &str) -> Result<RuleId, DatalogError> {
        let builtins = BuiltinRegistry::standard();
        program.add_rule(text, None, None, &RuleContext::new(&builtins))
    }

    #[test]
    fn test_recursive_program_has_recursive_stratum() {
        let mut program = Program::new("p");
        add(&mut program, "path(x, y) :- link(x, y)").unwrap();
        add(&mut program, "path(x, y) :- link(x, z), path(z, y)").unwrap();

        let strata = &program.stratification().strata;
        assert_eq!(strata.len(), 1);
        assert_eq!(strata[0].tables, vec!["path".to_string()]);
        assert!(strata[0].recursive);
    }

    #[test]
    fn test_references_are_external_only() {
        let mut program = Program::new("classification");
        add(&mut program, "p(x) :- nova:servers(x), classification:q(x), q(x)").unwrap();
        let refs: Vec<_> = program.references().into_iter().collect();
        assert_eq!(refs, vec![TableId::new("nova", "servers")]);
    }

    #[test]
    fn test_duplicate_rule_rejected() {
        let mut program = Program::new("p");
        add(&mut program, "q(x) :- r(x)").unwrap();
        assert!(matches!(
            add(&mut program, "q(x) :- r(x)."),
            Err(DatalogError::DuplicateRule(_))
        ));
    }

    #[test]
    fn test_head_arity_change_rejected() {
        let mut program = Program::new("p");
        add(&mut program, "q(x) :- r(x)").unwrap();
        assert!(matches!(
            add(&mut program, "q(x, y) :- r(x), s(y)"),
            Err(DatalogError::ArityMismatch { expected: 1, actual: 2, .. })
        ));
        assert_eq!(program.rules().len(), 1);
    }

    #[test]
    fn test_external_arity_checked_against_context() {
        let builtins = BuiltinRegistry::standard();
        let schema = |id: &TableId| (id.owner == "nova").then(|| TableSchema::anonymous(3));
        let ctx = RuleContext::new(&builtins).with_schemas(&schema);
        let program = Program::new("p");
        assert!(matches!(
            program.prepare("q(x) :- nova:servers(x)", &ctx),
            Err(DatalogError::ArityMismatch { expected: 3, actual: 1, .. })
        ));
        assert!(program.prepare("q(x) :- nova:servers(x, _, _)", &ctx).is_ok());
    }

    #[test]
    fn test_named_arguments_expand_against_schema() {
        let builtins = BuiltinRegistry::standard();
        let schema = |id: &TableId| {
            (id.name == "alarms").then(|| TableSchema::from_names(["name", "state", "severity"]))
        };
        let ctx = RuleContext::new(&builtins).with_schemas(&schema);
        let mut program = Program::new("p");

        let id = program
            .add_rule(r#"test(n) :- vitrage:alarms(name=n, state="Active")"#, None, None, &ctx)
            .unwrap();
        let stored = program.rule(id).unwrap();
        assert_eq!(stored.text, r#"test(n) :- vitrage:alarms(name=n, state="Active")"#);
        assert_eq!(
            stored.compiled.steps,
            vec![Step::Scan {
                source: Source::External(TableId::new("vitrage", "alarms")),
                args: vec![Slot::Var(0), Slot::Const(Value::from("Active")), Slot::Ignore],
                negated: false,
            }]
        );

        assert!(matches!(
            program.prepare("t(n) :- vitrage:alarms(n, name=m)", &ctx),
            Err(DatalogError::InvalidRule(_))
        ));
        assert!(matches!(
            program.prepare("t(n) :- vitrage:alarms(colour=n)", &ctx),
            Err(DatalogError::InvalidRule(_))
        ));
        assert!(matches!(
            program.prepare("t(n) :- nova:servers(id=n)", &ctx),
            Err(DatalogError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_builtin_arity_checked() {
        let mut program = Program::new("p");
        assert!(matches!(
            add(&mut program, "q(z) :- r(x), plus(x, z)"),
            Err(DatalogError::ArityMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_unsafe_head_variable() {
        let mut program = Program::new("p");
        assert!(matches!(
            add(&mut program, "q(x, y) :- r(x)"),
            Err(DatalogError::Unsafe(name)) if name == "y"
        ));
        assert!(matches!(
            add(&mut program, "q(x)"),
            Err(DatalogError::Unsafe(name)) if name == "x"
        ));
    }

    #[test]
    fn test_unsafe_negation_and_builtin_inputs() {
        let mut program = Program::new("p");
        assert!(matches!(
            add(&mut program, "q(x) :- r(x), not s(y)"),
            Err(DatalogError::Unsafe(name)) if name == "y"
        ));
        assert!(matches!(
            add(&mut program, "q(x) :- r(x), lt(x, y)"),
            Err(DatalogError::Unsafe(name)) if name == "y"
        ));
        assert!(add(&mut program, "q(x) :- r(x), not s(x, _)").is_ok());
    }

    #[test]
    fn test_builtin_output_binds_head() {
        let mut program = Program::new("p");
        add(&mut program, "q(z) :- r(x, y), builtin:plus(x, y, z)").unwrap();
        let compiled = &program.rules()[0].compiled;
        assert!(matches!(compiled.steps[1], Step::Call { .. }));
        assert_eq!(program.builtins_used().into_iter().collect::<Vec<_>>(), vec!["plus".to_string()]);
    }

    #[test]
    fn test_filters_run_after_their_inputs() {
        let mut program = Program::new("p");
        add(&mut program, "q(x) :- lt(x, y), r(x), s(y)").unwrap();
        let kinds: Vec<&str> = program.rules()[0]
            .compiled
            .steps
            .iter()
            .map(|s| match s {
                Step::Scan { .. } => "scan",
                Step::Call { .. } => "call",
            })
            .collect();
        assert_eq!(kinds, vec!["scan", "scan", "call"]);
    }

    #[test]
    fn test_builtin_names_cannot_be_derived() {
        let mut program = Program::new("p");
        add(&mut program, r#"q(z) :- r(x), concat(x, "!", z)"#).unwrap();
        assert!(matches!(
            add(&mut program, "concat(x, y, z) :- r(x), r(y), r(z)"),
            Err(DatalogError::InvalidRule(_))
        ));
        assert!(matches!(
            add(&mut program, "lt(x) :- r(x)"),
            Err(DatalogError::InvalidRule(_))
        ));
        assert_eq!(program.rules().len(), 1);
        assert!(program.builtins_used().contains("concat"));

        // Only the registry decides; unknown names stay table names.
        add(&mut program, "frobnicate(x) :- r(x)").unwrap();
    }

    #[test]
    fn test_unknown_builtin_accepted() {
        let mut program = Program::new("p");
        add(&mut program, "q(x, y) :- r(x), builtin:frobnicate(x, y)").unwrap();
        assert!(program.builtins_used().contains("frobnicate"));
    }

    #[test]
    fn test_negation_in_cycle_rejected() {
        let mut program = Program::new("p");
        add(&mut program, "a(x) :- r(x), not b(x)").unwrap();
        assert!(matches!(
            add(&mut program, "b(x) :- r(x), not a(x)"),
            Err(DatalogError::Unstratifiable(_))
        ));
        assert_eq!(program.rules().len(), 1);
    }

    #[test]
    fn test_negation_orders_strata() {
        let mut program = Program::new("p");
        add(&mut program, "reach(x) :- edge(x)").unwrap();
        add(&mut program, "unreached(x) :- node(x), not reach(x)").unwrap();
        let tables: Vec<_> = program
            .stratification()
            .strata
            .iter()
            .map(|s| s.tables.clone())
            .collect();
        assert_eq!(tables, vec![vec!["reach".to_string()], vec!["unreached".to_string()]]);
    }

    #[test]
    fn test_remove_rule() {
        let mut program = Program::new("p");
        let id = add(&mut program, "q(x) :- ds:r(x)").unwrap();
        let removed = program.remove_rule(id).unwrap();
        assert_eq!(removed.text, "q(x) :- ds:r(x)");
        assert!(program.references().is_empty());
        assert!(matches!(
            program.remove_rule(id),
            Err(DatalogError::RuleNotFound(_))
        ));
    }

    #[test]
    fn test_execute_head_table() {
        let mut program = Program::new("p");
        add(&mut program, "execute[nova:servers_pause(x)] :- nova:servers(x)").unwrap();
        let derived: Vec<_> = program.derived_tables().into_iter().collect();
        assert_eq!(derived, vec![("execute[nova:servers_pause]".to_string(), 1)]);
    }

    #[test]
    fn test_negated_builtin_rejected() {
        let mut program = Program::new("p");
        assert!(matches!(
            add(&mut program, "q(x) :- r(x), not lt(x, 3)"),
            Err(DatalogError::InvalidRule(_))
        ));
    }
}
