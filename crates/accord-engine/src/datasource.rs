//! The datasource adapter interface and the records flowing through it.

use std::collections::BTreeMap;

use accord_datalog::{Row, TableSchema, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AdapterError;

/// One polled row, keyed by column name.
///
/// Columns the record does not mention are stored as null.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub table: String,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Lay the fields out in schema order.
    pub fn to_row(&self, schema: &TableSchema) -> Row {
        schema
            .columns
            .iter()
            .map(|c| self.fields.get(&c.name).cloned().unwrap_or(Value::Null))
            .collect()
    }
}

/// How a webhook update is merged into its table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Add the rows, keeping everything already present.
    #[default]
    Insert,
    /// Make the rows the table's entire contents.
    Replace,
    /// Remove existing rows that share these column values with an incoming
    /// row, then add the rows.
    ReplaceByKey(Vec<String>),
}

/// Rows pushed into one table by a webhook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableUpdate {
    pub table: String,
    pub rows: Vec<Row>,
    pub mode: UpdateMode,
}

/// An action invocation against a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionCall {
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub positional: Vec<Value>,
    #[serde(default)]
    pub named: BTreeMap<String, Value>,
}

impl ActionCall {
    pub fn new(service: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = Value>) -> Self {
        self.positional.extend(args);
        self
    }
}

/// Adapter to an external service.
///
/// The engine owns status bookkeeping; adapters only report data and errors.
#[async_trait]
pub trait DatasourceAdapter: Send + Sync {
    /// Driver type name.
    fn driver(&self) -> &str;

    /// Tables this adapter populates, with their schemas.
    fn tables(&self) -> Vec<(String, TableSchema)>;

    /// Fetch the current state of every table.
    async fn poll(&self) -> Result<Vec<Record>, AdapterError>;

    /// Translate an inbound event into table updates.
    async fn handle_webhook(
        &self,
        _payload: &serde_json::Value,
    ) -> Result<Vec<TableUpdate>, AdapterError> {
        Err(AdapterError::WebhookUnsupported)
    }

    /// Names of the actions [`DatasourceAdapter::execute`] accepts.
    fn actions(&self) -> Vec<String> {
        Vec::new()
    }

    async fn execute(&self, call: &ActionCall) -> Result<(), AdapterError> {
        Err(AdapterError::UnknownAction(call.action.clone()))
    }
}

/// Request to register a datasource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Driver-specific settings, kept for display.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl DatasourceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A registered datasource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceInfo {
    pub id: Uuid,
    pub name: String,
    pub driver: String,
    pub description: Option<String>,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Health of a datasource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceStatus {
    /// Set after the first successful poll or webhook.
    pub initialized: bool,
    pub number_of_updates: u64,
    /// Most recent adapter error, cleared by the next successful update.
    pub last_error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}
