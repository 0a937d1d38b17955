//! Use Tracer
//!
//! Transitive closure of def→use arcs from a seed set. A node is *traced*
//! the first time the tracer visits it; visiting an already-traced node
//! yields no further expansion, which is what makes repeated queries over
//! the same region return no new work. Traversal follows
//! [`NodeFinder::ordered_uses`] so logs and results are reproducible.

use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use crate::finder::{NodeFinder, NodeId};
use crate::node::Node;

/// What one trace visited.
#[derive(Debug, Default)]
pub struct TraceResult {
    /// Seeds that had not been traced before this call.
    pub newly_traced_seeds: Vec<NodeId>,
    /// Non-seed nodes reached and traced by this call.
    pub reached: Vec<NodeId>,
}

impl TraceResult {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.newly_traced_seeds.is_empty() && self.reached.is_empty()
    }
}

/// Run one trace over `finder`, mutating the graph's traced set.
///
/// Seeds are [`Node`] snapshots rather than handles so that nodes the
/// integrator has already removed can still seed a trace: their uses are
/// found through the key-indexed use-sets, which survive node removal.
pub fn trace_from(
    finder: &NodeFinder,
    traced: &mut FxHashSet<NodeId>,
    seeds: &[Node],
) -> TraceResult {
    let mut ordered_seeds: Vec<&Node> = seeds.iter().collect();
    ordered_seeds.sort_by(|a, b| a.stable_order().cmp(&b.stable_order()));
    ordered_seeds.dedup_by(|a, b| a == b);

    let mut result = TraceResult::default();
    let mut worklist: VecDeque<NodeId> = VecDeque::new();
    let mut ghosts: Vec<&Node> = Vec::new();

    // Mark every live seed before expanding anything, so a seed reached
    // through another seed's uses is not misclassified as new work.
    for seed in ordered_seeds {
        let id = match seed.source() {
            Some(source) => finder.node_for_source(source, seed.key()),
            None => finder.expat_for(seed.key()),
        };
        match id {
            Some(id) => {
                if traced.insert(id) {
                    result.newly_traced_seeds.push(id);
                    worklist.push_back(id);
                }
            }
            None => ghosts.push(seed),
        }
    }

    // Seeds already removed from the graph expand through the use-sets
    // their keys left behind.
    for seed in ghosts {
        for use_id in finder.ordered_uses_of_key(seed.key()) {
            if traced.insert(use_id) {
                result.reached.push(use_id);
                worklist.push_back(use_id);
            }
        }
        if let (Some(source), Some(implementation)) =
            (seed.source(), seed.key().corresponding_implementation())
        {
            if let Some(twin) = finder.node_for_source(source, &implementation) {
                if traced.insert(twin) {
                    result.reached.push(twin);
                    worklist.push_back(twin);
                }
            }
        }
    }

    while let Some(id) = worklist.pop_front() {
        for use_id in finder.ordered_uses(id) {
            if traced.insert(use_id) {
                result.reached.push(use_id);
                worklist.push_back(use_id);
            }
        }
    }

    tracing::debug!(
        seeds = result.newly_traced_seeds.len(),
        reached = result.reached.len(),
        "traced"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{DeclAspect, DependencyKey, Designator};
    use crate::paths::SourcePath;

    fn key(name: &str) -> DependencyKey {
        DependencyKey::new(
            DeclAspect::Interface,
            Designator::TopLevel {
                name: name.to_owned(),
            },
        )
    }

    fn owned(name: &str, source: &str) -> Node {
        Node::new(key(name), None, Some(SourcePath::from(source)))
    }

    fn insert(finder: &mut NodeFinder, node: &Node) -> NodeId {
        finder.insert(node.clone());
        finder
            .node_for_source(node.source().unwrap(), node.key())
            .unwrap()
    }

    #[test]
    fn test_trace_reaches_transitive_uses() {
        let mut finder = NodeFinder::new();
        let a = owned("a", "j0.kdeps");
        let b = owned("b", "j1.kdeps");
        let c = owned("c", "j2.kdeps");
        insert(&mut finder, &a);
        let b_id = insert(&mut finder, &b);
        let c_id = insert(&mut finder, &c);
        finder.record_use(&key("a"), b_id);
        finder.record_use(&key("b"), c_id);

        let mut traced = FxHashSet::default();
        let result = trace_from(&finder, &mut traced, &[a.clone()]);
        assert_eq!(result.newly_traced_seeds.len(), 1);
        assert_eq!(result.reached, vec![b_id, c_id]);
    }

    #[test]
    fn test_second_trace_is_empty() {
        let mut finder = NodeFinder::new();
        let a = owned("a", "j0.kdeps");
        let b = owned("b", "j1.kdeps");
        insert(&mut finder, &a);
        let b_id = insert(&mut finder, &b);
        finder.record_use(&key("a"), b_id);

        let mut traced = FxHashSet::default();
        let first = trace_from(&finder, &mut traced, &[a.clone()]);
        assert!(!first.is_empty());
        let second = trace_from(&finder, &mut traced, &[a]);
        assert!(second.is_empty());
    }

    #[test]
    fn test_traced_set_grows_monotonically() {
        let mut finder = NodeFinder::new();
        let a = owned("a", "j0.kdeps");
        let b = owned("b", "j1.kdeps");
        insert(&mut finder, &a);
        insert(&mut finder, &b);

        let mut traced = FxHashSet::default();
        trace_from(&finder, &mut traced, &[a]);
        let after_first = traced.len();
        trace_from(&finder, &mut traced, &[b]);
        assert!(traced.len() >= after_first);
    }

    #[test]
    fn test_removed_seed_expands_by_key() {
        let mut finder = NodeFinder::new();
        let a = owned("a", "j0.kdeps");
        let b = owned("b", "j1.kdeps");
        let a_id = insert(&mut finder, &a);
        let b_id = insert(&mut finder, &b);
        finder.record_use(&key("a"), b_id);
        finder.remove(a_id);

        let mut traced = FxHashSet::default();
        let result = trace_from(&finder, &mut traced, &[a]);
        assert!(result.newly_traced_seeds.is_empty());
        assert_eq!(result.reached, vec![b_id]);
    }
}
