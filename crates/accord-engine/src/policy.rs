//! Policy and rule records exposed by the management API.

use std::sync::Arc;

use accord_datalog::{Evaluator, NaiveEvaluator, NonrecursiveEvaluator, RuleId, SemiNaiveEvaluator, StoredRule};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EngineConfig;

/// Evaluation strategy of a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Stratified semi-naive fixpoint.
    #[default]
    Recursive,
    /// One pass over rules in dependency order; recursion is rejected.
    Nonrecursive,
    /// Alternate engine restricted to numeric builtins.
    Z3,
}

impl PolicyKind {
    /// Evaluator implementing this kind.
    pub fn evaluator(self, config: &EngineConfig) -> Arc<dyn Evaluator> {
        match self {
            PolicyKind::Recursive => Arc::new(SemiNaiveEvaluator::new(config.max_fixpoint_iterations)),
            PolicyKind::Nonrecursive => Arc::new(NonrecursiveEvaluator),
            PolicyKind::Z3 => Arc::new(
                NaiveEvaluator::numeric().with_max_iterations(config.max_fixpoint_iterations),
            ),
        }
    }
}

/// A rule to add, with optional metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub rule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl RuleSpec {
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            name: None,
            comment: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl From<&str> for RuleSpec {
    fn from(rule: &str) -> Self {
        Self::new(rule)
    }
}

/// Request to create a policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    #[serde(default)]
    pub kind: PolicyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
    /// Starter rules, added all-or-nothing with the policy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleSpec>,
}

impl PolicySpec {
    pub fn new(name: impl Into<String>, kind: PolicyKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Self::default()
        }
    }

    pub fn with_rules<R: Into<RuleSpec>>(mut self, rules: impl IntoIterator<Item = R>) -> Self {
        self.rules.extend(rules.into_iter().map(Into::into));
        self
    }
}

/// A live policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyInfo {
    pub id: Uuid,
    pub name: String,
    pub kind: PolicyKind,
    pub description: Option<String>,
    pub abbreviation: String,
    pub created_at: DateTime<Utc>,
}

/// Health of a policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatus {
    /// Most recent evaluation error, cleared by the next successful evaluation.
    pub last_error: Option<String>,
    /// Evaluations run, successful or not.
    pub evaluations: u64,
    /// Most recent failed action dispatch.
    pub last_action_error: Option<String>,
}

/// A rule as stored in a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleInfo {
    pub id: RuleId,
    pub rule: String,
    pub name: Option<String>,
    pub comment: Option<String>,
}

impl From<&StoredRule> for RuleInfo {
    fn from(stored: &StoredRule) -> Self {
        Self {
            id: stored.id,
            rule: stored.text.clone(),
            name: stored.name.clone(),
            comment: stored.comment.clone(),
        }
    }
}

/// Default abbreviation: the first five characters of the name.
pub(crate) fn abbreviate(name: &str) -> String {
    name.chars().take(5).collect()
}

/// Policy and datasource names share one namespace of plain identifiers, so
/// every owner can be written as the qualifier of a rule literal.
pub(crate) fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name != "builtin"
}
