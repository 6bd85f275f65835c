//! Error types for the engine.

use std::time::Duration;

use accord_datalog::{DatalogError, StoreError};
use thiserror::Error;

use crate::translator::TranslateError;

/// Errors returned by datasource adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The adapter call did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The adapter does not accept webhook payloads.
    #[error("webhooks are not supported by this datasource")]
    WebhookUnsupported,

    /// A record or update names a table the adapter never declared.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The adapter does not expose the requested action.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// Translating a document into rows failed.
    #[error("translation failed: {0}")]
    Translate(#[from] TranslateError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote service reported a failure.
    #[error("{0}")]
    Failed(String),
}

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Policy not found.
    #[error("policy not found: {0}")]
    PolicyNotFound(String),

    /// A policy or datasource already uses this name.
    #[error("name already in use: {0}")]
    NameInUse(String),

    /// Policy and datasource names must be plain identifiers.
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// Datasource not found.
    #[error("datasource not found: {0}")]
    DatasourceNotFound(String),

    /// Table not found.
    #[error("table not found: {owner}:{table}")]
    TableNotFound { owner: String, table: String },

    /// Rule not found.
    #[error("rule {id} not found in policy {policy}")]
    RuleNotFound { policy: String, id: String },

    /// A rule was rejected when added to a policy.
    #[error("rule rejected by policy {policy}: {source}")]
    Rule {
        policy: String,
        #[source]
        source: DatalogError,
    },

    /// Adding the rule would put a nonrecursive policy on a cycle.
    #[error("rule would create a cycle through nonrecursive policy among {policies:?}")]
    NonrecursiveCycle { policies: Vec<String> },

    /// A datasource adapter failed.
    #[error("datasource {datasource} failed: {source}")]
    Adapter {
        datasource: String,
        #[source]
        source: AdapterError,
    },

    /// Malformed `service:action` name.
    #[error("invalid action name: {0:?}")]
    InvalidAction(String),

    /// Library policy not found.
    #[error("library policy not found: {0}")]
    LibraryPolicyNotFound(String),

    /// Library policy already exists.
    #[error("library policy already exists: {0}")]
    LibraryPolicyExists(String),

    /// Datalog error.
    #[error("datalog error: {0}")]
    Datalog(#[from] DatalogError),

    /// Fact store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub(crate) fn adapter(datasource: &str, source: AdapterError) -> Self {
        Self::Adapter {
            datasource: datasource.to_string(),
            source,
        }
    }
}
