//! Error types for the datalog core.

use thiserror::Error;

use crate::builtins::BuiltinError;
use crate::store::StoreError;

/// Errors that can occur when parsing, adding or evaluating rules.
#[derive(Debug, Error)]
pub enum DatalogError {
    /// Rule text could not be parsed.
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    /// The rule is well-formed but not acceptable for its policy.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// A table is used with a different number of columns than it has.
    #[error("arity mismatch for {table}: expected {expected} columns, got {actual}")]
    ArityMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    /// A variable is used before anything binds it.
    #[error("unsafe rule: variable `{0}` is not bound by a positive literal")]
    Unsafe(String),

    /// Negation occurs inside a recursive component.
    #[error("rule set is not stratifiable: negation of `{0}` inside a recursive cycle")]
    Unstratifiable(String),

    /// A recursive component in a policy that only allows a single pass.
    #[error("recursion among {tables:?} is not allowed in nonrecursive policy `{policy}`")]
    Recursion { policy: String, tables: Vec<String> },

    /// The same rule already exists in the policy.
    #[error("duplicate rule: {0}")]
    DuplicateRule(String),

    /// No rule with this id exists in the policy.
    #[error("rule not found: {0}")]
    RuleNotFound(String),

    /// The policy's evaluator cannot run a builtin used by the rule.
    #[error("builtin `{builtin}` is not supported by the {engine} engine")]
    UnsupportedBuiltin { builtin: String, engine: String },

    /// Builtin invocation failed in a way that invalidates the evaluation.
    #[error("builtin error: {0}")]
    Builtin(#[from] BuiltinError),

    /// Fact store rejected an update.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Evaluation failed.
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}
