//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use accord_datalog::{TableSchema, Value};
use accord_engine::{
    ActionCall, AdapterError, DatasourceAdapter, DatasourceConfig, Engine, EngineConfig, Record,
    TableUpdate,
};
use async_trait::async_trait;
use tokio::sync::Mutex;

/// Adapter whose polled rows and failures are set by the test.
pub struct FakeAdapter {
    tables: Vec<(String, TableSchema)>,
    records: Mutex<Vec<Record>>,
    failing: AtomicBool,
    actions: Vec<String>,
    rejected: Vec<String>,
    calls: Mutex<Vec<ActionCall>>,
    webhook: Mutex<Vec<TableUpdate>>,
}

impl FakeAdapter {
    pub fn new(tables: &[(&str, &[&str])]) -> Self {
        Self {
            tables: tables
                .iter()
                .map(|(name, columns)| (name.to_string(), TableSchema::from_names(columns.iter().copied())))
                .collect(),
            records: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            actions: Vec::new(),
            rejected: Vec::new(),
            calls: Mutex::new(Vec::new()),
            webhook: Mutex::new(Vec::new()),
        }
    }

    pub fn with_actions(mut self, actions: &[&str]) -> Self {
        self.actions = actions.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Declared actions that fail when executed.
    pub fn rejecting(mut self, actions: &[&str]) -> Self {
        self.rejected = actions.iter().map(|a| a.to_string()).collect();
        self.actions.extend(self.rejected.iter().cloned());
        self
    }

    /// Replace the rows of one table returned by the next poll.
    pub async fn set_rows(&self, table: &str, rows: &[&[Value]]) {
        let columns: Vec<String> = self
            .tables
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, schema)| schema.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default();

        let mut records = self.records.lock().await;
        records.retain(|r| r.table != table);
        for row in rows {
            let fields: BTreeMap<String, Value> =
                columns.iter().cloned().zip(row.iter().cloned()).collect();
            records.push(Record {
                table: table.to_string(),
                fields,
            });
        }
    }

    /// Updates returned by the next webhook, whatever its payload.
    pub async fn queue_webhook(&self, updates: Vec<TableUpdate>) {
        self.webhook.lock().await.extend(updates);
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn calls(&self) -> Vec<ActionCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl DatasourceAdapter for FakeAdapter {
    fn driver(&self) -> &str {
        "fake"
    }

    fn tables(&self) -> Vec<(String, TableSchema)> {
        self.tables.clone()
    }

    async fn poll(&self) -> Result<Vec<Record>, AdapterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AdapterError::Failed("service unavailable".to_string()));
        }
        Ok(self.records.lock().await.clone())
    }

    async fn handle_webhook(&self, _payload: &serde_json::Value) -> Result<Vec<TableUpdate>, AdapterError> {
        let updates = std::mem::take(&mut *self.webhook.lock().await);
        if updates.is_empty() {
            return Err(AdapterError::WebhookUnsupported);
        }
        Ok(updates)
    }

    fn actions(&self) -> Vec<String> {
        self.actions.clone()
    }

    async fn execute(&self, call: &ActionCall) -> Result<(), AdapterError> {
        self.calls.lock().await.push(call.clone());
        if self.rejected.contains(&call.action) {
            return Err(AdapterError::Failed(format!("{} refused", call.action)));
        }
        Ok(())
    }
}

/// Register a fake adapter under `name`.
pub async fn datasource(engine: &Engine, name: &str, adapter: FakeAdapter) -> Arc<FakeAdapter> {
    let adapter = Arc::new(adapter);
    engine
        .create_datasource(DatasourceConfig::new(name), adapter.clone())
        .await
        .unwrap();
    adapter
}

pub fn engine() -> Arc<Engine> {
    Engine::new(EngineConfig::default())
}

pub fn int_pairs(pairs: &[(i64, i64)]) -> Vec<Vec<Value>> {
    pairs
        .iter()
        .map(|(a, b)| vec![Value::from(*a), Value::from(*b)])
        .collect()
}

pub fn as_slices(rows: &[Vec<Value>]) -> Vec<&[Value]> {
    rows.iter().map(Vec::as_slice).collect()
}

pub const LINKS: [(i64, i64); 5] = [(1, 2), (2, 3), (2, 4), (4, 5), (4, 6)];

pub const CLOSURE: [(i64, i64); 11] = [
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
];
