//! Strongly connected components.
//!
//! Iterative Tarjan, so deep dependency chains never touch the call stack.

use std::collections::{BTreeMap, BTreeSet};

struct Frame<N> {
    node: N,
    neighbors: Vec<N>,
    next: usize,
}

/// Compute the strongly connected components of `graph`, where an edge
/// `a -> b` means "a depends on b".
///
/// Components are returned dependencies first: every component appears after
/// all components it has edges into. Nodes that only appear as edge targets
/// are included.
pub(crate) fn strongly_connected<N: Ord + Clone>(graph: &BTreeMap<N, BTreeSet<N>>) -> Vec<Vec<N>> {
    let mut nodes: BTreeSet<N> = graph.keys().cloned().collect();
    for targets in graph.values() {
        nodes.extend(targets.iter().cloned());
    }

    let neighbors_of = |node: &N| -> Vec<N> {
        graph
            .get(node)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    };

    let mut index: BTreeMap<N, usize> = BTreeMap::new();
    let mut lowlink: BTreeMap<N, usize> = BTreeMap::new();
    let mut on_stack: BTreeSet<N> = BTreeSet::new();
    let mut stack: Vec<N> = Vec::new();
    let mut counter = 0usize;
    let mut components = Vec::new();

    for root in &nodes {
        if index.contains_key(root) {
            continue;
        }

        index.insert(root.clone(), counter);
        lowlink.insert(root.clone(), counter);
        counter += 1;
        stack.push(root.clone());
        on_stack.insert(root.clone());
        let mut calls = vec![Frame {
            node: root.clone(),
            neighbors: neighbors_of(root),
            next: 0,
        }];

        while let Some(frame) = calls.last_mut() {
            if let Some(next) = frame.neighbors.get(frame.next).cloned() {
                frame.next += 1;
                let node = frame.node.clone();

                if !index.contains_key(&next) {
                    index.insert(next.clone(), counter);
                    lowlink.insert(next.clone(), counter);
                    counter += 1;
                    stack.push(next.clone());
                    on_stack.insert(next.clone());
                    let neighbors = neighbors_of(&next);
                    calls.push(Frame {
                        node: next,
                        neighbors,
                        next: 0,
                    });
                } else if on_stack.contains(&next) {
                    let next_index = index.get(&next).copied().unwrap_or(usize::MAX);
                    if let Some(low) = lowlink.get_mut(&node) {
                        *low = (*low).min(next_index);
                    }
                }
                continue;
            }

            let Some(done) = calls.pop() else { break };
            let low = lowlink.get(&done.node).copied().unwrap_or(usize::MAX);
            let own = index.get(&done.node).copied().unwrap_or(usize::MAX);

            if low == own {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack.remove(&member);
                    let is_root = member == done.node;
                    component.push(member);
                    if is_root {
                        break;
                    }
                }
                component.sort();
                components.push(component);
            }

            if let Some(parent) = calls.last()
                && let Some(parent_low) = lowlink.get_mut(&parent.node)
            {
                *parent_low = (*parent_low).min(low);
            }
        }
    }

    components
}

/// Whether a component is cyclic: more than one node, or a self-edge.
pub(crate) fn is_cyclic<N: Ord>(component: &[N], graph: &BTreeMap<N, BTreeSet<N>>) -> bool {
    match component {
        [single] => graph.get(single).is_some_and(|targets| targets.contains(single)),
        _ => component.len() > 1,
    }
}
