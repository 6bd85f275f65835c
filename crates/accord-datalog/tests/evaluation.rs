//! Fixpoint evaluation across strategies.

use std::collections::HashSet;

use accord_datalog::{
    BuiltinRegistry, Diff, Evaluator, FactStore, NaiveEvaluator, NonrecursiveEvaluator, Program,
    Row, RuleContext, SemiNaiveEvaluator, Snapshot, TableId, TableSchema, Value, row,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use test_case::test_case;

const PATH_RULES: [&str; 2] = [
    "path(x, y) :- graph:link(x, y)",
    "path(x, y) :- graph:link(x, z), path(z, y)",
];

fn program(rules: &[&str]) -> Program {
    let builtins = BuiltinRegistry::standard();
    let ctx = RuleContext::new(&builtins);
    let mut program = Program::new("reach");
    for rule in rules {
        program.add_rule(rule, None, None, &ctx).unwrap();
    }
    program
}

fn links(edges: &[(i64, i64)]) -> Snapshot {
    let mut source = Snapshot::default();
    source.insert(
        TableId::new("graph", "link"),
        edges.iter().map(|(a, b)| row![*a, *b]),
    );
    source
}

fn sorted(rows: &HashSet<Row>) -> Vec<Row> {
    let mut rows: Vec<Row> = rows.iter().cloned().collect();
    rows.sort();
    rows
}

fn evaluator(name: &str) -> Box<dyn Evaluator> {
    match name {
        "naive" => Box::new(NaiveEvaluator::numeric()),
        _ => Box::new(SemiNaiveEvaluator::default()),
    }
}

#[test_case("semi-naive")]
#[test_case("naive")]
fn path_closure(strategy: &str) {
    let source = links(&[(1, 2), (2, 3), (2, 4), (4, 5), (4, 6)]);
    let derived = evaluator(strategy)
        .evaluate(&program(&PATH_RULES), &source, &BuiltinRegistry::standard())
        .unwrap();

    let expected: Vec<Row> = [
        (1, 2),
        (1, 3),
        (1, 4),
        (1, 5),
        (1, 6),
        (2, 3),
        (2, 4),
        (2, 5),
        (2, 6),
        (4, 5),
        (4, 6),
    ]
    .into_iter()
    .map(|(a, b): (i64, i64)| row![a, b])
    .collect();
    assert_eq!(sorted(&derived["path"]), expected);
}

#[test]
fn path_closure_is_rejected_by_single_pass() {
    let result = NonrecursiveEvaluator.evaluate(
        &program(&PATH_RULES),
        &links(&[(1, 2)]),
        &BuiltinRegistry::standard(),
    );
    assert!(result.is_err());
}

#[test]
fn rule_order_does_not_change_results() {
    let rules = [
        "path(x, y) :- graph:link(x, y)",
        "path(x, y) :- path(x, z), path(z, y)",
        "isolated(x) :- graph:node(x), not connected(x)",
        "connected(x) :- path(x, _)",
        "connected(y) :- path(_, y)",
    ];
    let mut reversed = rules;
    reversed.reverse();

    let mut source = links(&[(1, 2), (2, 3), (3, 1), (5, 6)]);
    source.insert(
        TableId::new("graph", "node"),
        (1..=7).map(|i: i64| row![i]),
    );
    let builtins = BuiltinRegistry::standard();

    let forward = SemiNaiveEvaluator::default()
        .evaluate(&program(&rules), &source, &builtins)
        .unwrap();
    let backward = SemiNaiveEvaluator::default()
        .evaluate(&program(&reversed), &source, &builtins)
        .unwrap();
    let naive = NaiveEvaluator::default()
        .evaluate(&program(&rules), &source, &builtins)
        .unwrap();

    assert_eq!(forward, backward);
    assert_eq!(forward, naive);
    assert_eq!(sorted(&forward["isolated"]), vec![row![4], row![7]]);
    assert_eq!(forward["path"].len(), 10);
}

#[test]
fn evaluation_reads_store_snapshots() {
    let store = FactStore::default();
    let link = TableId::new("graph", "link");
    store.ensure_table(&link, TableSchema::from_names(["src", "dst"])).unwrap();
    store
        .apply_diff(&link, Diff::inserts([row![1, 2], row![2, 3]]))
        .unwrap();

    let derived = SemiNaiveEvaluator::default()
        .evaluate(&program(&PATH_RULES), &store, &BuiltinRegistry::standard())
        .unwrap();
    assert_eq!(derived["path"].len(), 3);
}

fn edge_list() -> impl Strategy<Value = Vec<(i64, i64)>> {
    prop::collection::vec((0i64..8, 0i64..8), 0..24)
}

fn row_strategy() -> impl Strategy<Value = Row> {
    prop::collection::vec(
        prop_oneof![
            (0i64..5).prop_map(Value::Int),
            "[a-c]".prop_map(Value::Str),
            Just(Value::Null),
        ],
        2,
    )
    .prop_map(Row::new)
}

proptest! {
    #[test]
    fn seminaive_matches_naive(edges in edge_list()) {
        let source = links(&edges);
        let builtins = BuiltinRegistry::standard();
        let program = program(&[
            PATH_RULES[0],
            PATH_RULES[1],
            "far(x, y) :- path(x, y), not graph:link(x, y)",
            "sum(x, y, s) :- path(x, y), plus(x, y, s)",
        ]);

        let fast = SemiNaiveEvaluator::default().evaluate(&program, &source, &builtins).unwrap();
        let slow = NaiveEvaluator::default().evaluate(&program, &source, &builtins).unwrap();
        prop_assert_eq!(fast, slow);
    }

    #[test]
    fn apply_diff_is_idempotent(
        inserts in prop::collection::vec(row_strategy(), 0..10),
        deletes in prop::collection::vec(row_strategy(), 0..10),
    ) {
        let store = FactStore::default();
        let table = TableId::new("ds", "t");
        store.ensure_table(&table, TableSchema::anonymous(2)).unwrap();

        let diff = Diff { inserts, deletes };
        store.apply_diff(&table, diff.clone()).unwrap();
        let once = store.rows(&table).unwrap();

        let second = store.apply_diff(&table, diff).unwrap();
        prop_assert!(second.is_none());
        prop_assert_eq!(store.rows(&table).unwrap(), once);
    }
}
