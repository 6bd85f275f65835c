//! A single engine replica.
//!
//! Holds the fact store, the live policies with their rule bases, the
//! cross-owner dependency graph and the registered datasources. Every change
//! to a table feeds a worklist that re-evaluates the policies reading it,
//! producers before consumers, until no derived table changes.
//!
//! All store writes happen under the state lock. Derived tables are staged
//! while a propagation runs and written only once it has converged.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use accord_datalog::ast::parse_execution_table;
use accord_datalog::{
    BuiltinRegistry, DependencyGraph, Diff, Evaluator, FactStore, Program, Row, RuleContext,
    RuleId, StoreError, TableChange, TableId, TableSchema, Value,
};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actions::{ActionExecutor, ExecutionFact};
use crate::config::EngineConfig;
use crate::datasource::{
    ActionCall, DatasourceAdapter, DatasourceConfig, DatasourceInfo, DatasourceStatus, Record,
    TableUpdate, UpdateMode,
};
use crate::error::{AdapterError, EngineError};
use crate::policy::{
    PolicyInfo, PolicyKind, PolicySpec, PolicyStatus, RuleInfo, RuleSpec, abbreviate, valid_name,
};
use crate::staged::{Staged, StagedTables};

struct PolicyEntry {
    info: PolicyInfo,
    program: Program,
    evaluator: Arc<dyn Evaluator>,
    status: PolicyStatus,
}

struct DatasourceEntry {
    info: DatasourceInfo,
    tables: BTreeMap<String, TableSchema>,
    status: DatasourceStatus,
}

#[derive(Default)]
struct EngineState {
    policies: BTreeMap<String, PolicyEntry>,
    graph: DependencyGraph,
}

/// One replica of the policy engine.
pub struct Engine {
    config: EngineConfig,
    store: FactStore,
    builtins: BuiltinRegistry,
    state: Mutex<EngineState>,
    datasources: DashMap<String, DatasourceEntry>,
    actions: ActionExecutor,
}

impl Engine {
    /// Create a replica with the standard builtins.
    pub fn new(config: EngineConfig) -> Arc<Self> {
        Self::with_builtins(config, BuiltinRegistry::standard())
    }

    pub fn with_builtins(config: EngineConfig, builtins: BuiltinRegistry) -> Arc<Self> {
        Arc::new(Self {
            store: FactStore::new(config.change_capacity),
            actions: ActionExecutor::new(config.action_timeout()),
            builtins,
            state: Mutex::new(EngineState::default()),
            datasources: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &FactStore {
        &self.store
    }

    pub fn builtins(&self) -> &BuiltinRegistry {
        &self.builtins
    }

    /// Receive every table change made in this replica.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<TableChange> {
        self.store.subscribe()
    }

    // ---- policies ----

    /// Create a policy, adding its starter rules all-or-nothing.
    #[tracing::instrument(skip(self, spec), fields(replica = %self.config.replica_id, policy = %spec.name))]
    pub async fn create_policy(&self, spec: PolicySpec) -> Result<PolicyInfo, EngineError> {
        if !valid_name(&spec.name) {
            return Err(EngineError::InvalidName(spec.name));
        }

        let info = {
            let mut state = self.state.lock().await;
            if state.policies.contains_key(&spec.name) || self.datasources.contains_key(&spec.name) {
                return Err(EngineError::NameInUse(spec.name));
            }

            let evaluator = spec.kind.evaluator(&self.config);
            let mut program = Program::new(spec.name.clone());
            for rule in &spec.rules {
                let prepared = self.prepare_rule(&state, &program, &*evaluator, spec.kind, rule)?;
                program.insert(prepared, rule.name.clone(), rule.comment.clone());
            }

            let info = PolicyInfo {
                id: Uuid::new_v4(),
                name: spec.name.clone(),
                kind: spec.kind,
                description: spec.description,
                abbreviation: spec.abbreviation.unwrap_or_else(|| abbreviate(&spec.name)),
                created_at: Utc::now(),
            };
            state.graph.set_references(&spec.name, program.references());
            state.policies.insert(
                spec.name.clone(),
                PolicyEntry {
                    info: info.clone(),
                    program,
                    evaluator,
                    status: PolicyStatus::default(),
                },
            );
            info
        };

        info!(kind = ?info.kind, rules = spec.rules.len(), "policy created");
        self.propagate(BTreeSet::from([info.name.clone()]), Vec::new())
            .await;
        Ok(info)
    }

    /// Delete a policy and its derived tables.
    #[tracing::instrument(skip(self), fields(replica = %self.config.replica_id))]
    pub async fn delete_policy(&self, name: &str) -> Result<PolicyInfo, EngineError> {
        let (entry, facts) = {
            let mut state = self.state.lock().await;
            let entry = state
                .policies
                .remove(name)
                .ok_or_else(|| EngineError::PolicyNotFound(name.to_string()))?;
            state.graph.remove_policy(name);
            self.actions.forget_policy(name).await;

            let changed = changed_ids(self.store.drop_owner(name));
            info!(tables = changed.len(), "policy deleted");
            let facts = self.propagate_locked(&mut state, BTreeSet::new(), changed).await;
            (entry, facts)
        };
        self.dispatch(facts).await;
        Ok(entry.info)
    }

    pub async fn list_policies(&self) -> Vec<PolicyInfo> {
        let state = self.state.lock().await;
        state.policies.values().map(|e| e.info.clone()).collect()
    }

    pub async fn get_policy(&self, name: &str) -> Result<PolicyInfo, EngineError> {
        let state = self.state.lock().await;
        state
            .policies
            .get(name)
            .map(|e| e.info.clone())
            .ok_or_else(|| EngineError::PolicyNotFound(name.to_string()))
    }

    pub async fn policy_status(&self, name: &str) -> Result<PolicyStatus, EngineError> {
        let state = self.state.lock().await;
        state
            .policies
            .get(name)
            .map(|e| e.status.clone())
            .ok_or_else(|| EngineError::PolicyNotFound(name.to_string()))
    }

    // ---- rules ----

    /// Add a rule to a policy and bring every dependent table up to date.
    #[tracing::instrument(skip(self, rule), fields(replica = %self.config.replica_id, rule = %rule.rule))]
    pub async fn create_rule(&self, policy: &str, rule: RuleSpec) -> Result<RuleInfo, EngineError> {
        let info = {
            let mut state = self.state.lock().await;
            let entry = state
                .policies
                .get(policy)
                .ok_or_else(|| EngineError::PolicyNotFound(policy.to_string()))?;
            let prepared =
                self.prepare_rule(&state, &entry.program, &*entry.evaluator, entry.info.kind, &rule)?;

            let state = &mut *state;
            let Some(entry) = state.policies.get_mut(policy) else {
                return Err(EngineError::PolicyNotFound(policy.to_string()));
            };
            let id = entry.program.insert(prepared, rule.name, rule.comment);
            state.graph.set_references(policy, entry.program.references());
            entry
                .program
                .rule(id)
                .map(RuleInfo::from)
                .ok_or_else(|| EngineError::RuleNotFound {
                    policy: policy.to_string(),
                    id: id.to_string(),
                })?
        };

        debug!(id = %info.id, "rule added");
        self.propagate(BTreeSet::from([policy.to_string()]), Vec::new())
            .await;
        Ok(info)
    }

    #[tracing::instrument(skip(self), fields(replica = %self.config.replica_id))]
    pub async fn delete_rule(&self, policy: &str, id: RuleId) -> Result<RuleInfo, EngineError> {
        let info = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let entry = state
                .policies
                .get_mut(policy)
                .ok_or_else(|| EngineError::PolicyNotFound(policy.to_string()))?;
            let removed = entry.program.remove_rule(id).map_err(|_| EngineError::RuleNotFound {
                policy: policy.to_string(),
                id: id.to_string(),
            })?;
            state.graph.set_references(policy, entry.program.references());
            RuleInfo::from(&removed)
        };

        debug!("rule deleted");
        self.propagate(BTreeSet::from([policy.to_string()]), Vec::new())
            .await;
        Ok(info)
    }

    pub async fn list_rules(&self, policy: &str) -> Result<Vec<RuleInfo>, EngineError> {
        let state = self.state.lock().await;
        let entry = state
            .policies
            .get(policy)
            .ok_or_else(|| EngineError::PolicyNotFound(policy.to_string()))?;
        Ok(entry.program.rules().iter().map(RuleInfo::from).collect())
    }

    /// Parse and check a rule against a policy without adding it.
    fn prepare_rule(
        &self,
        state: &EngineState,
        program: &Program,
        evaluator: &dyn Evaluator,
        kind: PolicyKind,
        rule: &RuleSpec,
    ) -> Result<accord_datalog::PreparedRule, EngineError> {
        let policy = program.policy();
        let rejected = |source| EngineError::Rule {
            policy: policy.to_string(),
            source,
        };

        let schema_of = |table: &TableId| self.store.schema(table);
        let ctx = RuleContext::new(&self.builtins).with_schemas(&schema_of);
        let prepared = program.prepare(&rule.rule, &ctx).map_err(rejected)?;
        evaluator
            .check_rule(policy, &prepared, &self.builtins)
            .map_err(rejected)?;

        let mut references = program.references();
        references.extend(prepared.references.iter().cloned());
        if let Some(policies) = state.graph.cycle_with(policy, &references) {
            let nonrecursive = policies.iter().any(|p| {
                let member_kind = if p == policy {
                    Some(kind)
                } else {
                    state.policies.get(p).map(|e| e.info.kind)
                };
                member_kind == Some(PolicyKind::Nonrecursive)
            });
            if nonrecursive {
                return Err(EngineError::NonrecursiveCycle { policies });
            }
        }
        Ok(prepared)
    }

    // ---- tables ----

    /// Sorted rows of a datasource or policy table.
    pub async fn list_rows(&self, owner: &str, table: &str) -> Result<Vec<Row>, EngineError> {
        let id = TableId::new(owner, table);
        let state = self.state.lock().await;
        if let Some(rows) = self.store.rows(&id) {
            let mut rows: Vec<Row> = rows.iter().cloned().collect();
            rows.sort();
            return Ok(rows);
        }

        // A derived table that has not produced anything yet is empty.
        match state.policies.get(owner) {
            Some(entry) if entry.program.derived_tables().contains_key(table) => Ok(Vec::new()),
            _ => Err(EngineError::TableNotFound {
                owner: owner.to_string(),
                table: table.to_string(),
            }),
        }
    }

    pub async fn table_schema(&self, owner: &str, table: &str) -> Result<TableSchema, EngineError> {
        let state = self.state.lock().await;
        if let Some(schema) = self.store.schema(&TableId::new(owner, table)) {
            return Ok(schema);
        }
        state
            .policies
            .get(owner)
            .and_then(|e| e.program.derived_tables().get(table).copied())
            .map(TableSchema::anonymous)
            .ok_or_else(|| EngineError::TableNotFound {
                owner: owner.to_string(),
                table: table.to_string(),
            })
    }

    /// Table names of a datasource or policy.
    pub async fn list_tables(&self, owner: &str) -> Result<Vec<String>, EngineError> {
        if let Some(entry) = self.datasources.get(owner) {
            return Ok(entry.tables.keys().cloned().collect());
        }
        let state = self.state.lock().await;
        state
            .policies
            .get(owner)
            .map(|e| e.program.derived_tables().into_keys().collect())
            .ok_or_else(|| EngineError::PolicyNotFound(owner.to_string()))
    }

    /// Re-evaluate every policy reading a table that was changed outside the
    /// engine's own update paths.
    pub async fn on_table_changed(&self, owner: &str, name: &str) {
        self.propagate(BTreeSet::new(), vec![TableId::new(owner, name)])
            .await;
    }

    // ---- datasources ----

    /// Register a datasource and create its (empty) tables.
    #[tracing::instrument(skip(self, config, adapter), fields(replica = %self.config.replica_id, datasource = %config.name))]
    pub async fn create_datasource(
        &self,
        config: DatasourceConfig,
        adapter: Arc<dyn DatasourceAdapter>,
    ) -> Result<DatasourceInfo, EngineError> {
        if !valid_name(&config.name) {
            return Err(EngineError::InvalidName(config.name));
        }
        let state = self.state.lock().await;
        if state.policies.contains_key(&config.name) || self.datasources.contains_key(&config.name) {
            return Err(EngineError::NameInUse(config.name));
        }

        let tables: BTreeMap<String, TableSchema> = adapter.tables().into_iter().collect();
        for (table, schema) in &tables {
            let id = TableId::new(&config.name, table);
            // Leftovers from an earlier datasource of the same name.
            if self.store.schema(&id).is_some_and(|s| &s != schema) {
                self.store.drop_table(&id);
            }
            self.store.ensure_table(&id, schema.clone())?;
        }

        let info = DatasourceInfo {
            id: Uuid::new_v4(),
            name: config.name.clone(),
            driver: adapter.driver().to_string(),
            description: config.description,
            config: config.config,
            created_at: Utc::now(),
        };
        self.actions.register(&config.name, adapter);
        self.datasources.insert(
            config.name,
            DatasourceEntry {
                info: info.clone(),
                tables,
                status: DatasourceStatus::default(),
            },
        );
        drop(state);

        info!(driver = %info.driver, "datasource created");
        Ok(info)
    }

    /// Remove a datasource and its tables.
    #[tracing::instrument(skip(self), fields(replica = %self.config.replica_id))]
    pub async fn delete_datasource(&self, name: &str) -> Result<DatasourceInfo, EngineError> {
        let (entry, facts) = {
            let mut state = self.state.lock().await;
            let (_, entry) = self
                .datasources
                .remove(name)
                .ok_or_else(|| EngineError::DatasourceNotFound(name.to_string()))?;
            self.actions.unregister(name);

            let changed = changed_ids(self.store.drop_owner(name));
            info!(tables = changed.len(), "datasource deleted");
            let facts = self.propagate_locked(&mut state, BTreeSet::new(), changed).await;
            (entry, facts)
        };
        self.dispatch(facts).await;
        Ok(entry.info)
    }

    pub fn has_datasource(&self, name: &str) -> bool {
        self.datasources.contains_key(name)
    }

    pub fn list_datasources(&self) -> Vec<DatasourceInfo> {
        let mut out: Vec<DatasourceInfo> = self.datasources.iter().map(|e| e.info.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn datasource_status(&self, name: &str) -> Result<DatasourceStatus, EngineError> {
        self.datasources
            .get(name)
            .map(|e| e.status.clone())
            .ok_or_else(|| EngineError::DatasourceNotFound(name.to_string()))
    }

    /// Poll a datasource now and propagate what changed.
    ///
    /// Every table of the datasource is replaced in one step. On failure
    /// every table keeps its last-known-good contents.
    #[tracing::instrument(skip(self), fields(replica = %self.config.replica_id))]
    pub async fn poll_datasource(&self, name: &str) -> Result<usize, EngineError> {
        let adapter = self
            .actions
            .adapter(name)
            .ok_or_else(|| EngineError::DatasourceNotFound(name.to_string()))?;
        let timeout = self.config.poll_timeout();

        let result = match tokio::time::timeout(timeout, adapter.poll()).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout(timeout)),
        };

        let (count, facts) = {
            let mut state = self.state.lock().await;
            let grouped = match result.and_then(|records| self.group_records(name, records)) {
                Ok(grouped) => grouped,
                Err(e) => return Err(self.record_failure(name, e)),
            };
            let tables = grouped
                .into_iter()
                .map(|(table, rows)| (TableId::new(name, &table), rows))
                .collect();
            let changed = match self.store.replace_all(tables) {
                Ok(changes) => changed_ids(changes),
                Err(e) => return Err(self.record_store_failure(name, e)),
            };
            self.record_success(name);

            debug!(changed = changed.len(), "datasource polled");
            let count = changed.len();
            let facts = self.propagate_locked(&mut state, BTreeSet::new(), changed).await;
            (count, facts)
        };
        self.dispatch(facts).await;
        Ok(count)
    }

    fn group_records(
        &self,
        name: &str,
        records: Vec<Record>,
    ) -> Result<BTreeMap<String, Vec<Row>>, AdapterError> {
        let entry = self
            .datasources
            .get(name)
            .ok_or_else(|| AdapterError::Failed(format!("datasource {} was deleted", name)))?;
        let mut grouped: BTreeMap<String, Vec<Row>> = entry
            .tables
            .keys()
            .map(|t| (t.clone(), Vec::new()))
            .collect();
        for record in records {
            let schema = entry
                .tables
                .get(&record.table)
                .ok_or_else(|| AdapterError::UnknownTable(record.table.clone()))?;
            let row = record.to_row(schema);
            grouped.entry(record.table).or_default().push(row);
        }
        Ok(grouped)
    }

    /// Deliver an inbound event to a datasource.
    #[tracing::instrument(skip(self, payload), fields(replica = %self.config.replica_id))]
    pub async fn send_webhook(&self, name: &str, payload: serde_json::Value) -> Result<usize, EngineError> {
        let adapter = self
            .actions
            .adapter(name)
            .ok_or_else(|| EngineError::DatasourceNotFound(name.to_string()))?;
        let timeout = self.config.poll_timeout();

        let updates = match tokio::time::timeout(timeout, adapter.handle_webhook(&payload)).await {
            Ok(Ok(updates)) => updates,
            Ok(Err(e)) => return Err(self.record_failure(name, e)),
            Err(_) => return Err(self.record_failure(name, AdapterError::Timeout(timeout))),
        };

        let (count, facts) = {
            let mut state = self.state.lock().await;
            let diffs = match self.webhook_diffs(name, updates) {
                Ok(diffs) => diffs,
                Err(e) => return Err(self.record_failure(name, e)),
            };
            let changed = match self.store.apply_all(diffs) {
                Ok(changes) => changed_ids(changes),
                Err(e) => return Err(self.record_store_failure(name, e)),
            };
            self.record_success(name);

            debug!(changed = changed.len(), "webhook applied");
            let count = changed.len();
            let facts = self.propagate_locked(&mut state, BTreeSet::new(), changed).await;
            (count, facts)
        };
        self.dispatch(facts).await;
        Ok(count)
    }

    /// Fold webhook updates, in order, into per-table diffs against the
    /// stored rows. Every table is checked before anything is returned.
    fn webhook_diffs(
        &self,
        name: &str,
        updates: Vec<TableUpdate>,
    ) -> Result<Vec<(TableId, Diff)>, AdapterError> {
        let entry = self
            .datasources
            .get(name)
            .ok_or_else(|| AdapterError::Failed(format!("datasource {} was deleted", name)))?;

        let mut working: BTreeMap<String, HashSet<Row>> = BTreeMap::new();
        for update in updates {
            let schema = entry
                .tables
                .get(&update.table)
                .ok_or_else(|| AdapterError::UnknownTable(update.table.clone()))?;
            let rows = working.entry(update.table.clone()).or_insert_with(|| {
                self.store
                    .rows(&TableId::new(name, &update.table))
                    .map(|rows| (*rows).clone())
                    .unwrap_or_default()
            });

            match &update.mode {
                UpdateMode::Insert => {}
                UpdateMode::Replace => rows.clear(),
                UpdateMode::ReplaceByKey(columns) => {
                    let indexes = columns
                        .iter()
                        .map(|c| {
                            schema.index_of(c).ok_or_else(|| {
                                AdapterError::Failed(format!(
                                    "table {} has no key column {}",
                                    update.table, c
                                ))
                            })
                        })
                        .collect::<Result<Vec<usize>, _>>()?;
                    // Rows sharing a key within one update form a group and
                    // replace that key's rows together.
                    let incoming: HashSet<Vec<Value>> =
                        update.rows.iter().map(|row| key_of(&indexes, row)).collect();
                    rows.retain(|row| !incoming.contains(&key_of(&indexes, row)));
                }
            }
            rows.extend(update.rows);
        }

        Ok(working
            .into_iter()
            .map(|(table, rows)| {
                let id = TableId::new(name, &table);
                let current = self.store.rows(&id).unwrap_or_default();
                let diff = Diff {
                    inserts: rows.difference(&current).cloned().collect(),
                    deletes: current.difference(&rows).cloned().collect(),
                };
                (id, diff)
            })
            .collect())
    }

    fn record_success(&self, name: &str) {
        if let Some(mut entry) = self.datasources.get_mut(name) {
            entry.status.initialized = true;
            entry.status.number_of_updates += 1;
            entry.status.last_error = None;
            entry.status.last_updated = Some(Utc::now());
        }
    }

    fn record_failure(&self, name: &str, error: AdapterError) -> EngineError {
        self.note_failure(name, &error);
        EngineError::adapter(name, error)
    }

    fn record_store_failure(&self, name: &str, error: StoreError) -> EngineError {
        self.note_failure(name, &error);
        EngineError::Store(error)
    }

    fn note_failure(&self, name: &str, error: &dyn std::fmt::Display) {
        warn!(datasource = name, error = %error, "datasource update failed");
        if let Some(mut entry) = self.datasources.get_mut(name) {
            entry.status.last_error = Some(error.to_string());
        }
    }

    // ---- actions ----

    /// Run an action directly against a datasource.
    #[tracing::instrument(skip(self, call), fields(replica = %self.config.replica_id, service = %call.service, action = %call.action))]
    pub async fn execute_datasource_action(&self, call: ActionCall) -> Result<(), EngineError> {
        self.actions.execute(&call).await
    }

    /// Run an action on behalf of a policy, naming it `service:action`.
    #[tracing::instrument(skip(self, positional, named), fields(replica = %self.config.replica_id))]
    pub async fn execute_policy_action(
        &self,
        policy: &str,
        action: &str,
        positional: Vec<Value>,
        named: BTreeMap<String, Value>,
    ) -> Result<(), EngineError> {
        if !self.state.lock().await.policies.contains_key(policy) {
            return Err(EngineError::PolicyNotFound(policy.to_string()));
        }
        let (service, action_name) = action
            .split_once(':')
            .filter(|(s, a)| !s.is_empty() && !a.is_empty())
            .ok_or_else(|| EngineError::InvalidAction(action.to_string()))?;
        let call = ActionCall {
            service: service.to_string(),
            action: action_name.to_string(),
            positional,
            named,
        };

        let result = self.actions.execute(&call).await;
        if let Err(e) = &result {
            self.record_action_error(policy, e.to_string()).await;
        }
        result
    }

    async fn record_action_error(&self, policy: &str, error: String) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.policies.get_mut(policy) {
            entry.status.last_action_error = Some(error);
        }
    }

    // ---- propagation ----

    /// Re-evaluate `dirty` and every policy reading a `changed` table, then
    /// dispatch new execution facts.
    async fn propagate(&self, dirty: BTreeSet<String>, changed: Vec<TableId>) {
        let facts = {
            let mut state = self.state.lock().await;
            self.propagate_locked(&mut state, dirty, changed).await
        };
        self.dispatch(facts).await;
    }

    /// Evaluate policies in rank order, producers before consumers, while
    /// evaluations keep changing tables. A policy evaluated more than
    /// `max_propagation_rounds` times abandons the propagation and leaves
    /// every derived table as it was.
    async fn propagate_locked(
        &self,
        state: &mut EngineState,
        dirty: BTreeSet<String>,
        changed: Vec<TableId>,
    ) -> Vec<ExecutionFact> {
        let ranks = state.graph.ranks();
        let rank = |policy: &str| ranks.get(policy).copied().unwrap_or(usize::MAX);

        let mut queue: BTreeSet<(usize, String)> = BTreeSet::new();
        for policy in dirty {
            if state.policies.contains_key(&policy) {
                queue.insert((rank(&policy), policy));
            }
        }
        for table in &changed {
            for policy in state.graph.subscribers(table) {
                queue.insert((rank(&policy), policy));
            }
        }

        let mut staged = StagedTables::new(&self.store);
        let mut evaluations: HashMap<String, usize> = HashMap::new();
        while let Some((_, policy)) = queue.pop_first() {
            let count = evaluations.entry(policy.clone()).or_default();
            *count += 1;
            if *count > self.config.max_propagation_rounds {
                let message = format!(
                    "propagation did not converge: {} was evaluated more than {} times",
                    policy, self.config.max_propagation_rounds
                );
                warn!(replica = %self.config.replica_id, %message, "derived tables left unchanged");
                let pending = queue.into_iter().map(|(_, p)| p);
                for name in evaluations.into_keys().chain(pending) {
                    if let Some(entry) = state.policies.get_mut(&name) {
                        entry.status.last_error = Some(message.clone());
                    }
                }
                return Vec::new();
            }

            for table in self.evaluate_policy(state, &policy, &mut staged) {
                for subscriber in state.graph.subscribers(&table) {
                    queue.insert((rank(&subscriber), subscriber));
                }
            }
        }

        self.commit(state, staged).await
    }

    /// Evaluate one policy against the staged tables and stage its derived
    /// tables. Returns the tables whose contents changed.
    fn evaluate_policy(
        &self,
        state: &mut EngineState,
        name: &str,
        staged: &mut StagedTables<'_>,
    ) -> Vec<TableId> {
        let Some(entry) = state.policies.get_mut(name) else {
            return Vec::new();
        };
        entry.status.evaluations += 1;

        let derived = match entry
            .evaluator
            .evaluate(&entry.program, &*staged, &self.builtins)
        {
            Ok(derived) => derived,
            Err(e) => {
                warn!(
                    replica = %self.config.replica_id,
                    policy = name,
                    error = %e,
                    "policy evaluation failed"
                );
                entry.status.last_error = Some(e.to_string());
                return Vec::new();
            }
        };
        entry.status.last_error = None;

        let arities = entry.program.derived_tables();
        let mut changed = Vec::new();

        for id in staged.tables(name) {
            if !derived.contains_key(&id.name) && staged.drop_table(id.clone()) {
                changed.push(id);
            }
        }
        for (table, rows) in derived {
            let id = TableId::new(name, &table);
            let arity = arities.get(&table).copied().unwrap_or_default();
            if staged.replace(id.clone(), arity, rows) {
                changed.push(id);
            }
        }

        if !changed.is_empty() {
            debug!(policy = name, changed = changed.len(), "derived tables staged");
        }
        changed
    }

    /// Write the staged tables of a converged propagation, then collect the
    /// execution facts that are new in their final contents.
    async fn commit(&self, state: &mut EngineState, staged: StagedTables<'_>) -> Vec<ExecutionFact> {
        let mut facts = Vec::new();
        for (id, table) in staged.into_tables() {
            let rows = match table {
                Some(Staged { arity, rows }) => {
                    if let Err(e) = self.write_table(&id, arity, &rows) {
                        warn!(replica = %self.config.replica_id, table = %id, error = %e, "derived table not written");
                        if let Some(entry) = state.policies.get_mut(&id.owner) {
                            entry.status.last_error = Some(e.to_string());
                        }
                    }
                    rows
                }
                None => {
                    self.store.drop_table(&id);
                    Arc::default()
                }
            };
            if parse_execution_table(&id.name).is_some() {
                facts.extend(self.actions.observe(&id.owner, &id.name, &rows).await);
            }
        }
        facts
    }

    fn write_table(&self, id: &TableId, arity: usize, rows: &HashSet<Row>) -> Result<(), StoreError> {
        if self.store.arity(id).is_some_and(|a| a != arity) {
            self.store.drop_table(id);
        }
        self.store.ensure_table(id, TableSchema::anonymous(arity))?;
        self.store.replace(id, rows.iter().cloned())?;
        Ok(())
    }

    async fn dispatch(&self, facts: Vec<ExecutionFact>) {
        if facts.is_empty() {
            return;
        }
        for dispatch in self.actions.on_new_execution_facts(facts).await {
            if let Err(e) = dispatch.result {
                self.record_action_error(&dispatch.fact.policy, e.to_string())
                    .await;
            }
        }
    }

    /// Sizes of every derived table, keyed by `policy:table`.
    pub async fn derived_sizes(&self) -> HashMap<String, usize> {
        let state = self.state.lock().await;
        self.store
            .sizes()
            .into_iter()
            .filter(|(id, _)| state.policies.contains_key(&id.owner))
            .map(|(id, size)| (id.to_string(), size))
            .collect()
    }
}

fn key_of(indexes: &[usize], row: &Row) -> Vec<Value> {
    indexes
        .iter()
        .map(|i| row.get(*i).cloned().unwrap_or(Value::Null))
        .collect()
}

fn changed_ids(changes: Vec<TableChange>) -> Vec<TableId> {
    changes
        .into_iter()
        .filter(|c| !c.is_empty())
        .map(|c| c.table)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{TranslatorDriver, TranslatorDriverConfig};
    use crate::translator::{FieldTranslator, HdictTranslator, Translator};
    use crate::driver::{DocumentSource, Mapping};
    use accord_datalog::row;
    use serde_json::json;

    fn links_driver(document: serde_json::Value) -> Arc<TranslatorDriver> {
        let translator = Translator::Hdict(HdictTranslator {
            table: "link".to_string(),
            parent_key: None,
            id_column: None,
            in_list: true,
            fields: vec![FieldTranslator::new("src"), FieldTranslator::new("dst")],
        });
        Arc::new(
            TranslatorDriver::new(TranslatorDriverConfig {
                source: DocumentSource::Inline { document },
                poll: vec![Mapping::new(translator)],
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_names_are_shared_between_policies_and_datasources() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .create_datasource(DatasourceConfig::new("net"), links_driver(json!([])))
            .await
            .unwrap();
        assert!(matches!(
            engine.create_policy(PolicySpec::new("net", PolicyKind::Recursive)).await,
            Err(EngineError::NameInUse(_))
        ));
        assert!(matches!(
            engine.create_policy(PolicySpec::new("a:b", PolicyKind::Recursive)).await,
            Err(EngineError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_starter_rules_are_all_or_nothing() {
        let engine = Engine::new(EngineConfig::default());
        let spec = PolicySpec::new("p", PolicyKind::Recursive)
            .with_rules(["q(x) :- net:link(x, _)", "r(x) :- q(x"]);
        assert!(matches!(
            engine.create_policy(spec).await,
            Err(EngineError::Rule { .. })
        ));
        assert!(engine.list_policies().await.is_empty());
    }

    #[tokio::test]
    async fn test_poll_failure_keeps_last_known_good() {
        let engine = Engine::new(EngineConfig::default());
        let driver = links_driver(json!([{"src": 1, "dst": 2}]));
        engine
            .create_datasource(DatasourceConfig::new("net"), driver.clone())
            .await
            .unwrap();
        engine.poll_datasource("net").await.unwrap();
        assert_eq!(engine.list_rows("net", "link").await.unwrap(), vec![row![1, 2]]);

        driver.set_document(json!({"not": "a list"})).await;
        assert!(engine.poll_datasource("net").await.is_err());
        assert_eq!(engine.list_rows("net", "link").await.unwrap(), vec![row![1, 2]]);

        let status = engine.datasource_status("net").unwrap();
        assert!(status.initialized);
        assert_eq!(status.number_of_updates, 1);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_evaluation_error_is_isolated() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .create_datasource(
                DatasourceConfig::new("net"),
                links_driver(json!([{"src": 1, "dst": "x"}])),
            )
            .await
            .unwrap();
        engine
            .create_policy(
                PolicySpec::new("healthy", PolicyKind::Recursive)
                    .with_rules(["src(x) :- net:link(x, _)"]),
            )
            .await
            .unwrap();
        // `div` by a string fails its domain and only drops that binding.
        engine
            .create_policy(
                PolicySpec::new("odd", PolicyKind::Recursive)
                    .with_rules(["half(z) :- net:link(x, y), div(x, y, z)"]),
            )
            .await
            .unwrap();
        engine.poll_datasource("net").await.unwrap();

        assert_eq!(engine.list_rows("healthy", "src").await.unwrap(), vec![row![1]]);
        assert!(engine.list_rows("odd", "half").await.unwrap().is_empty());
        assert_eq!(engine.policy_status("odd").await.unwrap().last_error, None);
    }

    #[tokio::test]
    async fn test_rule_removal_drops_its_table() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .create_policy(PolicySpec::new("p", PolicyKind::Recursive))
            .await
            .unwrap();
        let rule = engine.create_rule("p", RuleSpec::new("t(1)")).await.unwrap();
        assert_eq!(engine.list_rows("p", "t").await.unwrap(), vec![row![1]]);
        assert_eq!(engine.list_tables("p").await.unwrap(), vec!["t".to_string()]);

        engine.delete_rule("p", rule.id).await.unwrap();
        assert!(engine.list_rows("p", "t").await.is_err());
        assert!(engine.list_tables("p").await.unwrap().is_empty());
        assert!(engine.delete_rule("p", rule.id).await.is_err());
    }

    #[tokio::test]
    async fn test_head_arity_change_replaces_table() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .create_policy(PolicySpec::new("p", PolicyKind::Recursive))
            .await
            .unwrap();
        let first = engine.create_rule("p", RuleSpec::new("t(1)")).await.unwrap();
        engine.delete_rule("p", first.id).await.unwrap();
        engine.create_rule("p", RuleSpec::new("t(1, 2)")).await.unwrap();
        assert_eq!(engine.list_rows("p", "t").await.unwrap(), vec![row![1, 2]]);
        assert_eq!(engine.table_schema("p", "t").await.unwrap().arity(), 2);
    }
}
