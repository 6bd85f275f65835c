//! Generic translator-driven datasource.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use accord_datalog::{Row, TableSchema};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::datasource::{ActionCall, DatasourceAdapter, Record, TableUpdate, UpdateMode};
use crate::error::AdapterError;
use crate::translator::{TranslateError, Translated, Translator, lookup};

/// Where polled documents come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentSource {
    /// A document held in memory.
    Inline {
        #[serde(default)]
        document: Json,
    },
    /// A JSON file re-read on every poll.
    File { path: PathBuf },
}

impl Default for DocumentSource {
    fn default() -> Self {
        DocumentSource::Inline {
            document: Json::Null,
        }
    }
}

/// A translator applied to part of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Dotted path selecting the sub-document; the whole document if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    pub translator: Translator,
    /// Columns identifying an entity in the top-level table. Webhook rows
    /// sharing these values with an incoming row are replaced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
}

impl Mapping {
    pub fn new(translator: Translator) -> Self {
        Self {
            root: None,
            translator,
            key: Vec::new(),
        }
    }

    pub fn at(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn keyed_by<S: Into<String>>(mut self, key: impl IntoIterator<Item = S>) -> Self {
        self.key = key.into_iter().map(Into::into).collect();
        self
    }

    fn select<'a>(&self, doc: &'a Json) -> &'a Json {
        match &self.root {
            Some(root) => lookup(doc, root),
            None => doc,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslatorDriverConfig {
    #[serde(default)]
    pub source: DocumentSource,
    /// Applied to the polled document.
    #[serde(default)]
    pub poll: Vec<Mapping>,
    /// Applied to each webhook payload.
    #[serde(default)]
    pub webhook: Vec<Mapping>,
    /// Action names accepted by `execute`.
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Adapter that turns JSON documents into tables through [`Translator`]s.
///
/// Executed actions are only recorded, for inspection.
pub struct TranslatorDriver {
    config: TranslatorDriverConfig,
    schemas: BTreeMap<String, TableSchema>,
    keys: HashMap<String, Option<Vec<String>>>,
    document: RwLock<Option<Json>>,
    executed: RwLock<Vec<ActionCall>>,
}

impl TranslatorDriver {
    pub fn new(config: TranslatorDriverConfig) -> Result<Self, AdapterError> {
        let mut schemas = BTreeMap::new();
        let mut keys = HashMap::new();

        for mapping in config.poll.iter().chain(&config.webhook) {
            mapping.translator.validate()?;
            for (table, schema) in mapping.translator.schemas() {
                match schemas.get(&table) {
                    Some(existing) if existing != &schema => {
                        return Err(TranslateError::InvalidTranslator(format!(
                            "table {} is declared with two different schemas",
                            table
                        ))
                        .into());
                    }
                    _ => {
                        schemas.insert(table, schema);
                    }
                }
            }
        }
        for mapping in &config.webhook {
            let tables = mapping.translator.tables();
            for (position, translator) in tables.into_iter().enumerate() {
                let Some(table) = translator.table() else {
                    continue;
                };
                let key = if position == 0 && !mapping.key.is_empty() {
                    Some(mapping.key.clone())
                } else if position == 0 {
                    None
                } else {
                    translator.key_columns()
                };
                keys.insert(table.to_string(), key);
            }
        }

        Ok(Self {
            config,
            schemas,
            keys,
            document: RwLock::new(None),
            executed: RwLock::new(Vec::new()),
        })
    }

    /// Replace the polled document, overriding the configured source.
    pub async fn set_document(&self, document: Json) {
        *self.document.write().await = Some(document);
    }

    /// Actions executed so far, oldest first.
    pub async fn executed(&self) -> Vec<ActionCall> {
        self.executed.read().await.clone()
    }

    async fn load(&self) -> Result<Json, AdapterError> {
        if let Some(document) = self.document.read().await.as_ref() {
            return Ok(document.clone());
        }
        match &self.config.source {
            DocumentSource::Inline { document } => Ok(document.clone()),
            DocumentSource::File { path } => {
                let text = tokio::fs::read_to_string(path).await?;
                Ok(serde_json::from_str(&text)?)
            }
        }
    }

    fn translate(mapping: &Mapping, doc: &Json, received_at: &str) -> Result<Translated, AdapterError> {
        Ok(mapping.translator.translate(mapping.select(doc), received_at)?)
    }
}

#[async_trait]
impl DatasourceAdapter for TranslatorDriver {
    fn driver(&self) -> &str {
        "translator"
    }

    fn tables(&self) -> Vec<(String, TableSchema)> {
        self.schemas
            .iter()
            .map(|(table, schema)| (table.clone(), schema.clone()))
            .collect()
    }

    async fn poll(&self) -> Result<Vec<Record>, AdapterError> {
        let doc = self.load().await?;
        let received_at = Utc::now().to_rfc3339();
        let mut records = Vec::new();
        for mapping in &self.config.poll {
            for (table, rows) in Self::translate(mapping, &doc, &received_at)? {
                let Some(schema) = self.schemas.get(&table) else {
                    continue;
                };
                records.extend(rows.into_iter().map(|row| to_record(&table, schema, row)));
            }
        }
        debug!(records = records.len(), "translated polled document");
        Ok(records)
    }

    async fn handle_webhook(&self, payload: &Json) -> Result<Vec<TableUpdate>, AdapterError> {
        if self.config.webhook.is_empty() {
            return Err(AdapterError::WebhookUnsupported);
        }
        let received_at = Utc::now().to_rfc3339();
        let mut updates = Vec::new();
        for mapping in &self.config.webhook {
            let doc = mapping.select(payload);
            if doc.is_null() {
                continue;
            }
            for (table, rows) in Self::translate(mapping, payload, &received_at)? {
                let mode = match self.keys.get(&table).cloned().flatten() {
                    Some(key) => UpdateMode::ReplaceByKey(key),
                    None => UpdateMode::Insert,
                };
                updates.push(TableUpdate { table, rows, mode });
            }
        }
        Ok(updates)
    }

    fn actions(&self) -> Vec<String> {
        self.config.actions.clone()
    }

    async fn execute(&self, call: &ActionCall) -> Result<(), AdapterError> {
        if !self.config.actions.contains(&call.action) {
            return Err(AdapterError::UnknownAction(call.action.clone()));
        }
        info!(
            service = %call.service,
            action = %call.action,
            args = ?call.positional,
            "action executed"
        );
        self.executed.write().await.push(call.clone());
        Ok(())
    }
}

fn to_record(table: &str, schema: &TableSchema, row: Row) -> Record {
    Record {
        table: table.to_string(),
        fields: schema
            .columns
            .iter()
            .map(|c| c.name.clone())
            .zip(row.into_values())
            .collect(),
    }
}
