//! Cross-owner dependency analysis for incremental propagation.
//!
//! Tracks which policies read which tables, so that a change to one table
//! recomputes only the policies that can observe it, in producer-before-
//! consumer order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::scc::{is_cyclic, strongly_connected};
use crate::value::TableId;

/// Subscription graph between tables and the policies that read them.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Table -> policies whose rules read it.
    subscribers: HashMap<TableId, BTreeSet<String>>,
    /// Policy -> tables its rules read.
    references: HashMap<String, HashSet<TableId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy (if new) and replace the set of tables it reads.
    pub fn set_references(&mut self, policy: &str, references: HashSet<TableId>) {
        self.unsubscribe(policy);
        for table in &references {
            self.subscribers
                .entry(table.clone())
                .or_default()
                .insert(policy.to_string());
        }
        self.references.insert(policy.to_string(), references);
    }

    /// Forget a policy and every edge out of it.
    pub fn remove_policy(&mut self, policy: &str) {
        self.unsubscribe(policy);
        self.references.remove(policy);
    }

    fn unsubscribe(&mut self, policy: &str) {
        let Some(previous) = self.references.get(policy) else {
            return;
        };
        for table in previous {
            if let Some(policies) = self.subscribers.get_mut(table) {
                policies.remove(policy);
                if policies.is_empty() {
                    self.subscribers.remove(table);
                }
            }
        }
    }

    pub fn contains_policy(&self, policy: &str) -> bool {
        self.references.contains_key(policy)
    }

    /// Tables a policy reads.
    pub fn references(&self, policy: &str) -> Option<&HashSet<TableId>> {
        self.references.get(policy)
    }

    /// Policies that directly read a table.
    pub fn subscribers(&self, table: &TableId) -> BTreeSet<String> {
        self.subscribers.get(table).cloned().unwrap_or_default()
    }

    /// Every table with at least one subscriber.
    pub fn subscribed_tables(&self) -> impl Iterator<Item = &TableId> {
        self.subscribers.keys()
    }

    /// Policies that can observe a change to any of `tables`, directly or
    /// through other policies' derived tables.
    pub fn transitive_dependents<'a>(
        &self,
        tables: impl IntoIterator<Item = &'a TableId>,
    ) -> BTreeSet<String> {
        let mut dependents = BTreeSet::new();
        let mut to_process: Vec<String> = tables
            .into_iter()
            .flat_map(|t| self.subscribers(t))
            .collect();

        while let Some(policy) = to_process.pop() {
            if !dependents.insert(policy.clone()) {
                continue;
            }
            for (table, readers) in &self.subscribers {
                if table.owner == policy {
                    to_process.extend(readers.iter().filter(|r| !dependents.contains(*r)).cloned());
                }
            }
        }

        dependents
    }

    /// Policy -> policies it reads from.
    pub fn policy_edges(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.edges_with(None)
    }

    fn edges_with(
        &self,
        overlay: Option<(&str, &HashSet<TableId>)>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let empty = HashSet::new();
        let overlay_policy = overlay.map(|(p, _)| p);
        let known = |owner: &str| self.references.contains_key(owner) || overlay_policy == Some(owner);

        let mut policies: Vec<(&str, &HashSet<TableId>)> = self
            .references
            .iter()
            .map(|(p, t)| (p.as_str(), t))
            .collect();
        if let Some(policy) = overlay_policy
            && !self.references.contains_key(policy)
        {
            policies.push((policy, &empty));
        }

        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (policy, tables) in policies {
            let upstream = edges.entry(policy.to_string()).or_default();
            let extra = overlay
                .filter(|(p, _)| *p == policy)
                .map(|(_, t)| t.iter())
                .into_iter()
                .flatten();
            for table in tables.iter().chain(extra) {
                if known(&table.owner) {
                    upstream.insert(table.owner.clone());
                }
            }
        }
        edges
    }

    /// Evaluation rank of every policy: a policy's rank is at least that of
    /// each policy it reads from, and policies in one cycle share a rank.
    pub fn ranks(&self) -> HashMap<String, usize> {
        let edges = self.policy_edges();
        let mut ranks = HashMap::new();
        for (rank, component) in strongly_connected(&edges).into_iter().enumerate() {
            for policy in component {
                ranks.insert(policy, rank);
            }
        }
        ranks
    }

    /// Policies that would share a cycle with `policy` if it also read
    /// `additional`. Returns `None` when the policy would not be on a cycle.
    pub fn cycle_with(&self, policy: &str, additional: &HashSet<TableId>) -> Option<Vec<String>> {
        let edges = self.edges_with(Some((policy, additional)));
        strongly_connected(&edges)
            .into_iter()
            .find(|component| component.iter().any(|p| p == policy))
            .filter(|component| is_cyclic(component, &edges))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(tables: &[(&str, &str)]) -> HashSet<TableId> {
        tables.iter().map(|(o, n)| TableId::new(*o, *n)).collect()
    }

    #[test]
    fn test_subscribers_follow_reference_updates() {
        let mut graph = DependencyGraph::new();
        graph.set_references("p", refs(&[("nova", "servers")]));
        assert_eq!(
            graph.subscribers(&TableId::new("nova", "servers")),
            BTreeSet::from(["p".to_string()])
        );

        graph.set_references("p", refs(&[("neutron", "ports")]));
        assert!(graph.subscribers(&TableId::new("nova", "servers")).is_empty());

        graph.remove_policy("p");
        assert!(graph.subscribers(&TableId::new("neutron", "ports")).is_empty());
        assert!(!graph.contains_policy("p"));
    }

    #[test]
    fn test_transitive_dependents_follow_policy_tables() {
        let mut graph = DependencyGraph::new();
        graph.set_references("a", refs(&[("ds", "t")]));
        graph.set_references("b", refs(&[("a", "out")]));
        graph.set_references("c", refs(&[("b", "out")]));
        graph.set_references("unrelated", refs(&[("ds", "other")]));

        let dependents = graph.transitive_dependents([&TableId::new("ds", "t")]);
        assert_eq!(
            dependents,
            BTreeSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_cycle_with_unregistered_policy() {
        let mut graph = DependencyGraph::new();
        graph.set_references("a", refs(&[("fresh", "out")]));
        assert_eq!(
            graph.cycle_with("fresh", &refs(&[("a", "out")])),
            Some(vec!["a".to_string(), "fresh".to_string()])
        );
        assert_eq!(graph.cycle_with("fresh", &refs(&[("ds", "t")])), None);
    }

    #[test]
    fn test_ranks_order_producers_first() {
        let mut graph = DependencyGraph::new();
        graph.set_references("consumer", refs(&[("producer", "x")]));
        graph.set_references("producer", refs(&[("ds", "t")]));
        let ranks = graph.ranks();
        assert!(ranks["producer"] < ranks["consumer"]);
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = DependencyGraph::new();
        graph.set_references("a", refs(&[("b", "x")]));
        graph.set_references("b", HashSet::new());

        assert_eq!(graph.cycle_with("b", &HashSet::new()), None);
        assert_eq!(
            graph.cycle_with("b", &refs(&[("a", "y")])),
            Some(vec!["a".to_string(), "b".to_string()])
        );

        graph.set_references("b", refs(&[("a", "y")]));
        let ranks = graph.ranks();
        assert_eq!(ranks["a"], ranks["b"]);
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.set_references("a", HashSet::new());
        assert_eq!(
            graph.cycle_with("a", &refs(&[("a", "x")])),
            Some(vec!["a".to_string()])
        );
    }
}
