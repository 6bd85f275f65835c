//! Dispatch of derived execution facts to datasource adapters.
//!
//! Each `execute[service:action]` table of a policy is compared against the
//! generation seen at the previous evaluation. Rows that newly appear are
//! dispatched once; rows that persist are not; rows that disappear are
//! forgotten, so a later reappearance dispatches again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use accord_datalog::Row;
use accord_datalog::ast::parse_execution_table;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::datasource::{ActionCall, DatasourceAdapter};
use crate::error::{AdapterError, EngineError};

/// One newly derived execution fact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFact {
    pub policy: String,
    pub call: ActionCall,
}

/// Result of dispatching one fact.
#[derive(Debug)]
pub struct Dispatch {
    pub fact: ExecutionFact,
    pub result: Result<(), EngineError>,
}

/// Registry of adapters that accept actions, plus per-table generations of
/// execution facts.
pub struct ActionExecutor {
    adapters: DashMap<String, Arc<dyn DatasourceAdapter>>,
    timeout: Duration,
    /// (policy, execute table) -> rows seen at the previous evaluation.
    generations: Mutex<HashMap<(String, String), HashSet<Row>>>,
}

impl ActionExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            adapters: DashMap::new(),
            timeout,
            generations: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, service: &str, adapter: Arc<dyn DatasourceAdapter>) {
        self.adapters.insert(service.to_string(), adapter);
    }

    pub fn unregister(&self, service: &str) -> Option<Arc<dyn DatasourceAdapter>> {
        self.adapters.remove(service).map(|(_, adapter)| adapter)
    }

    pub fn adapter(&self, service: &str) -> Option<Arc<dyn DatasourceAdapter>> {
        self.adapters.get(service).map(|a| Arc::clone(a.value()))
    }

    /// Record the current contents of an execute table and return the facts
    /// that were not present in the previous generation.
    ///
    /// `table` must be an execution table name; anything else yields nothing.
    pub async fn observe(&self, policy: &str, table: &str, current: &HashSet<Row>) -> Vec<ExecutionFact> {
        let Some((service, action)) = parse_execution_table(table) else {
            return Vec::new();
        };

        let mut generations = self.generations.lock().await;
        let previous = generations
            .entry((policy.to_string(), table.to_string()))
            .or_default();

        let mut new_rows: Vec<&Row> = current.iter().filter(|r| !previous.contains(*r)).collect();
        new_rows.sort();
        let facts = new_rows
            .into_iter()
            .map(|row| ExecutionFact {
                policy: policy.to_string(),
                call: ActionCall::new(service, action).with_args(row.values().iter().cloned()),
            })
            .collect();

        previous.clone_from(current);
        if previous.is_empty() {
            generations.remove(&(policy.to_string(), table.to_string()));
        }
        facts
    }

    /// Drop every generation belonging to a policy.
    pub async fn forget_policy(&self, policy: &str) {
        self.generations
            .lock()
            .await
            .retain(|(owner, _), _| owner != policy);
    }

    /// Dispatch newly derived facts, one call per fact, in order.
    ///
    /// Failures are reported in the returned list and never retried.
    pub async fn on_new_execution_facts(&self, facts: Vec<ExecutionFact>) -> Vec<Dispatch> {
        let mut dispatches = Vec::with_capacity(facts.len());
        for fact in facts {
            let result = self.execute(&fact.call).await;
            match &result {
                Ok(()) => info!(
                    policy = %fact.policy,
                    service = %fact.call.service,
                    action = %fact.call.action,
                    "dispatched execution fact"
                ),
                Err(e) => error!(
                    policy = %fact.policy,
                    service = %fact.call.service,
                    action = %fact.call.action,
                    error = %e,
                    "failed to dispatch execution fact"
                ),
            }
            dispatches.push(Dispatch { fact, result });
        }
        dispatches
    }

    /// Run one action against the adapter registered for its service.
    pub async fn execute(&self, call: &ActionCall) -> Result<(), EngineError> {
        let adapter = self
            .adapter(&call.service)
            .ok_or_else(|| EngineError::DatasourceNotFound(call.service.clone()))?;

        if !adapter.actions().contains(&call.action) {
            return Err(EngineError::adapter(
                &call.service,
                AdapterError::UnknownAction(call.action.clone()),
            ));
        }

        debug!(service = %call.service, action = %call.action, "executing action");
        match tokio::time::timeout(self.timeout, adapter.execute(call)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::adapter(&call.service, e)),
            Err(_) => Err(EngineError::adapter(
                &call.service,
                AdapterError::Timeout(self.timeout),
            )),
        }
    }
}
