//! Library of policy templates that can be activated as live policies.

use std::collections::BTreeMap;
use std::path::Path;

use accord_datalog::parse_rule;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::policy::{PolicyInfo, PolicyKind, PolicySpec, RuleSpec};

/// A stored policy template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryPolicy {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: PolicyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl LibraryPolicy {
    fn to_spec(&self) -> PolicySpec {
        PolicySpec {
            name: self.name.clone(),
            kind: self.kind,
            description: self.description.clone(),
            abbreviation: self.abbreviation.clone(),
            rules: self.rules.clone(),
        }
    }
}

/// In-memory policy library keyed by name.
#[derive(Default)]
pub struct PolicyLibrary {
    policies: RwLock<BTreeMap<String, LibraryPolicy>>,
}

impl PolicyLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.json` file in a directory, one policy per file.
    ///
    /// Files that fail to parse or validate are skipped with a warning.
    pub async fn load_dir(&self, dir: &Path) -> Result<usize, EngineError> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let result = match read_policy(&path).await {
                Ok(policy) => self.create(policy).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => loaded += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping library policy"),
            }
        }

        info!(dir = %dir.display(), loaded, "loaded library policies");
        Ok(loaded)
    }

    pub async fn list(&self) -> Vec<LibraryPolicy> {
        self.policies.read().await.values().cloned().collect()
    }

    /// Look a policy up by name or id.
    pub async fn get(&self, name_or_id: &str) -> Result<LibraryPolicy, EngineError> {
        let policies = self.policies.read().await;
        find(&policies, name_or_id)
            .cloned()
            .ok_or_else(|| EngineError::LibraryPolicyNotFound(name_or_id.to_string()))
    }

    /// Add a policy after checking that every rule parses.
    pub async fn create(&self, policy: LibraryPolicy) -> Result<LibraryPolicy, EngineError> {
        for rule in &policy.rules {
            parse_rule(&rule.rule).map_err(|source| EngineError::Rule {
                policy: policy.name.clone(),
                source,
            })?;
        }

        let mut policies = self.policies.write().await;
        if policies.contains_key(&policy.name) || policies.values().any(|p| p.id == policy.id) {
            return Err(EngineError::LibraryPolicyExists(policy.name));
        }
        policies.insert(policy.name.clone(), policy.clone());
        Ok(policy)
    }

    pub async fn delete(&self, name_or_id: &str) -> Result<LibraryPolicy, EngineError> {
        let mut policies = self.policies.write().await;
        let name = find(&policies, name_or_id)
            .map(|p| p.name.clone())
            .ok_or_else(|| EngineError::LibraryPolicyNotFound(name_or_id.to_string()))?;
        policies
            .remove(&name)
            .ok_or(EngineError::LibraryPolicyNotFound(name))
    }

    /// Create a live policy in `engine` from a library entry.
    pub async fn activate(&self, engine: &Engine, name_or_id: &str) -> Result<PolicyInfo, EngineError> {
        let policy = self.get(name_or_id).await?;
        engine.create_policy(policy.to_spec()).await
    }
}

async fn read_policy(path: &Path) -> Result<LibraryPolicy, EngineError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&text)?)
}

fn find<'a>(policies: &'a BTreeMap<String, LibraryPolicy>, name_or_id: &str) -> Option<&'a LibraryPolicy> {
    policies.get(name_or_id).or_else(|| {
        let id = Uuid::parse_str(name_or_id).ok()?;
        policies.values().find(|p| p.id == id)
    })
}
