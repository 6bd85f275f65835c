//! `accord eval` and `accord check`: offline rule evaluation.

use std::collections::BTreeMap;
use std::path::Path;

use accord_datalog::{
    BuiltinRegistry, Program, Row, RuleContext, Snapshot, TableId, Value, parse_rules,
};
use accord_engine::{EngineConfig, PolicyKind};
use miette::{IntoDiagnostic, Result, WrapErr, miette};

/// Name of the policy rules files are loaded into.
const POLICY: &str = "cli";

pub async fn run_eval(rules: &Path, facts: Option<&Path>, table: &str, kind: PolicyKind) -> Result<()> {
    let program = load_program(rules, kind).await?;
    let source = match facts {
        Some(path) => load_facts(path).await?,
        None => Snapshot::default(),
    };

    let rows = evaluate(&program, &source, table, kind)?;
    let json = serde_json::to_string_pretty(&rows).into_diagnostic()?;
    println!("{}", json);
    Ok(())
}

pub async fn run_check(rules: &Path, kind: PolicyKind) -> Result<()> {
    let program = load_program(rules, kind).await?;
    println!(
        "{}: {} rules, tables {}",
        rules.display(),
        program.rules().len(),
        program
            .derived_tables()
            .into_iter()
            .map(|(table, arity)| format!("{}/{}", table, arity))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

async fn load_program(path: &Path, kind: PolicyKind) -> Result<Program> {
    let text = tokio::fs::read_to_string(path)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    build_program(&text, kind)
}

fn build_program(text: &str, kind: PolicyKind) -> Result<Program> {
    let builtins = BuiltinRegistry::standard();
    let evaluator = kind.evaluator(&EngineConfig::default());
    let ctx = RuleContext::new(&builtins);
    let mut program = Program::new(POLICY);

    for (statement, _) in parse_rules(text).into_diagnostic()? {
        let prepared = program
            .prepare(&statement, &ctx)
            .into_diagnostic()
            .wrap_err_with(|| format!("rule rejected: {}", statement))?;
        evaluator
            .check_rule(POLICY, &prepared, &builtins)
            .into_diagnostic()
            .wrap_err_with(|| format!("rule rejected: {}", statement))?;
        program.insert(prepared, None, None);
    }
    Ok(program)
}

async fn load_facts(path: &Path) -> Result<Snapshot> {
    let text = tokio::fs::read_to_string(path)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    parse_facts(&text)
}

fn parse_facts(text: &str) -> Result<Snapshot> {
    let tables: BTreeMap<String, Vec<Vec<serde_json::Value>>> =
        serde_json::from_str(text).into_diagnostic()?;

    let mut source = Snapshot::default();
    for (name, rows) in tables {
        let (owner, table) = name
            .split_once(':')
            .ok_or_else(|| miette!("fact table {} must be written owner:table", name))?;
        source.insert(
            TableId::new(owner, table),
            rows.iter()
                .map(|row| Row::new(row.iter().map(Value::from_json).collect())),
        );
    }
    Ok(source)
}

fn evaluate(program: &Program, source: &Snapshot, table: &str, kind: PolicyKind) -> Result<Vec<Row>> {
    let builtins = BuiltinRegistry::standard();
    let evaluator = kind.evaluator(&EngineConfig::default());
    let derived = evaluator
        .evaluate(program, source, &builtins)
        .into_diagnostic()?;

    if !program.derived_tables().contains_key(table) {
        return Err(miette!("table {} is not defined by the rules", table));
    }
    let mut rows: Vec<Row> = derived
        .get(table)
        .map(|rows| rows.iter().cloned().collect())
        .unwrap_or_default();
    rows.sort();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_datalog::row;
    use pretty_assertions::assert_eq;

    const RULES: &str = "
        # reachability
        path(x, y) :- graph:link(x, y)
        path(x, y) :- graph:link(x, z),
            path(z, y)
    ";

    #[test]
    fn test_eval_path() {
        let program = build_program(RULES, PolicyKind::Recursive).unwrap();
        let facts = parse_facts(r#"{"graph:link": [[1, 2], [2, 3]]}"#).unwrap();
        let rows = evaluate(&program, &facts, "path", PolicyKind::Recursive).unwrap();
        assert_eq!(rows, vec![row![1, 2], row![1, 3], row![2, 3]]);
        assert!(evaluate(&program, &facts, "missing", PolicyKind::Recursive).is_err());
        assert_eq!(
            serde_json::to_string(&rows[0]).unwrap(),
            r#"{"data":[1,2]}"#
        );
    }

    #[test]
    fn test_check_rejects_by_kind() {
        assert!(build_program(RULES, PolicyKind::Nonrecursive).is_err());
        assert!(build_program(r#"s(x) :- t:n(y), concat(y, "a", x)"#, PolicyKind::Z3).is_err());
        assert!(build_program("p(x) :- q(x", PolicyKind::Recursive).is_err());
    }

    #[test]
    fn test_facts_need_qualified_tables() {
        assert!(parse_facts(r#"{"link": [[1, 2]]}"#).is_err());
    }
}
