//! Datalog core for Accord.
//!
//! This crate provides:
//! - The rule language (parser and AST) with qualified `owner:table` references
//! - The builtin registry used inside rule bodies
//! - Per-policy rule bases with safety, arity and stratification checks
//! - The cross-owner dependency graph used to scope recomputation
//! - The concurrent fact store holding datasource and derived tables
//! - Interchangeable fixpoint evaluators (semi-naive, nonrecursive, naive)

pub mod ast;
pub mod builtins;
pub mod dependency;
mod error;
pub mod eval;
mod parser;
pub mod program;
mod scc;
pub mod schema;
pub mod store;
mod value;

pub use ast::{Atom, Head, Literal, Rule, TableRef, Term};
pub use builtins::{Builtin, BuiltinClass, BuiltinError, BuiltinRegistry, Outcome};
pub use dependency::DependencyGraph;
pub use error::DatalogError;
pub use eval::{
    DerivedTables, Evaluator, NaiveEvaluator, NonrecursiveEvaluator, SemiNaiveEvaluator,
    TableSource,
};
pub use parser::{parse_rule, parse_rules};
pub use program::{PreparedRule, Program, RuleContext, RuleId, Stratification, Stratum, StoredRule};
pub use schema::{Column, TableSchema};
pub use store::{Diff, FactStore, Snapshot, StoreError, TableChange};
pub use value::{Row, TableId, Value};
