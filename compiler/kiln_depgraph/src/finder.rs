//! Node Finder
//!
//! Indexed store for module-graph nodes. Nodes live in an arena keyed by
//! [`NodeId`] handles; compound indexes answer lookups by `(source, key)`,
//! by key alone, and by source alone. The def→use relation is a multimap
//! keyed by the *full* dependency key, not node identity, so multiple
//! providers of one key share a use-set and expat replacement carries uses
//! over for free.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::key::{DeclAspect, DependencyKey};
use crate::node::Node;
use crate::paths::SourcePath;

/// Handle to a node in the finder's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena plus compound indexes over the module graph's nodes.
#[derive(Debug, Default)]
pub struct NodeFinder {
    nodes: FxHashMap<NodeId, Node>,
    next_id: u32,
    /// (source, key) → node, for owned nodes.
    owned: FxHashMap<SourcePath, FxHashMap<DependencyKey, NodeId>>,
    /// key → expat node. At most one expat per key.
    expats: FxHashMap<DependencyKey, NodeId>,
    /// key → every node carrying that key, owned or expat.
    ids_by_key: FxHashMap<DependencyKey, FxHashSet<NodeId>>,
    /// def key → nodes that use any provider of that key.
    uses_by_def: FxHashMap<DependencyKey, FxHashSet<NodeId>>,
    /// Reverse of `uses_by_def`, for O(degree) removal.
    defs_used_by: FxHashMap<NodeId, FxHashSet<DependencyKey>>,
}

impl NodeFinder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Insert a node, replacing any prior node at the same `(source, key)`
    /// slot and returning it.
    ///
    /// Replacement reuses the handle, so arcs that reference the slot as a
    /// use survive; this is the swap-in-place the node lifecycle requires.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        let key = node.key().clone();
        let slot = match node.source() {
            Some(source) => self
                .owned
                .entry(source.clone())
                .or_default()
                .entry(key.clone()),
            None => self.expats.entry(key.clone()),
        };
        match slot {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let id = *entry.get();
                self.nodes.insert(id, node)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let id = NodeId(self.next_id);
                self.next_id += 1;
                entry.insert(id);
                self.ids_by_key.entry(key).or_default().insert(id);
                self.nodes.insert(id, node);
                None
            }
        }
    }

    /// Remove a node: first strip it from every def's use-set, then drop
    /// it from the indexes and the arena.
    pub fn remove(&mut self, id: NodeId) -> Option<Node> {
        self.clear_uses_of(id);
        let node = self.nodes.remove(&id)?;
        if let Some(ids) = self.ids_by_key.get_mut(node.key()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.ids_by_key.remove(node.key());
            }
        }
        match node.source() {
            Some(source) => {
                if let Some(by_key) = self.owned.get_mut(source) {
                    by_key.remove(node.key());
                    if by_key.is_empty() {
                        self.owned.remove(source);
                    }
                }
            }
            None => {
                self.expats.remove(node.key());
            }
        }
        Some(node)
    }

    /// Forget every arc in which `id` is the use end.
    ///
    /// Integration calls this on surviving nodes before re-recording their
    /// arcs, so a reload that drops a dependency also drops the stale arc.
    pub fn clear_uses_of(&mut self, id: NodeId) {
        if let Some(defs) = self.defs_used_by.remove(&id) {
            for def in defs {
                if let Some(uses) = self.uses_by_def.get_mut(&def) {
                    uses.remove(&id);
                    if uses.is_empty() {
                        self.uses_by_def.remove(&def);
                    }
                }
            }
        }
    }

    /// Record that `use_id` uses any provider of `def`. Returns whether
    /// the arc is new.
    pub fn record_use(&mut self, def: &DependencyKey, use_id: NodeId) -> bool {
        let is_new = self
            .uses_by_def
            .entry(def.clone())
            .or_default()
            .insert(use_id);
        if is_new {
            self.defs_used_by
                .entry(use_id)
                .or_default()
                .insert(def.clone());
        }
        is_new
    }

    #[must_use]
    pub fn node_for_source(&self, source: &SourcePath, key: &DependencyKey) -> Option<NodeId> {
        self.owned.get(source)?.get(key).copied()
    }

    #[must_use]
    pub fn expat_for(&self, key: &DependencyKey) -> Option<NodeId> {
        self.expats.get(key).copied()
    }

    /// Every node carrying `key`, regardless of source.
    pub fn ids_for_key(&self, key: &DependencyKey) -> impl Iterator<Item = NodeId> + '_ {
        self.ids_by_key
            .get(key)
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
    }

    /// Handles of all nodes owned by `source`, sorted by key.
    #[must_use]
    pub fn nodes_owned_by(&self, source: &SourcePath) -> Vec<NodeId> {
        let Some(by_key) = self.owned.get(source) else {
            return Vec::new();
        };
        let mut entries: Vec<(&DependencyKey, NodeId)> =
            by_key.iter().map(|(k, &id)| (k, id)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, id)| id).collect()
    }

    /// Every source that owns at least one node.
    pub fn sources(&self) -> impl Iterator<Item = &SourcePath> {
        self.owned.keys()
    }

    pub fn all_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().map(|(&id, node)| (id, node))
    }

    /// The use-set of a def key, if any arcs were recorded for it.
    #[must_use]
    pub fn uses_of_def(&self, def: &DependencyKey) -> Option<&FxHashSet<NodeId>> {
        self.uses_by_def.get(def)
    }

    /// Def keys that have at least one recorded use, unordered.
    pub fn def_keys(&self) -> impl Iterator<Item = &DependencyKey> {
        self.uses_by_def.keys()
    }

    /// All nodes that must be visited after `id` changes.
    ///
    /// This is the single home of the implicit interface→implementation
    /// rule: for an interface node, the same-source implementation twin is
    /// yielded as if an arc existed, without ever storing one.
    #[must_use]
    pub fn find_uses(&self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.nodes.get(&id) else {
            return Vec::new();
        };
        let mut result: Vec<NodeId> = self
            .uses_by_def
            .get(node.key())
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
            .collect();
        if node.key().aspect == DeclAspect::Interface {
            if let (Some(source), Some(implementation)) =
                (node.source(), node.key().corresponding_implementation())
            {
                if let Some(twin) = self.node_for_source(source, &implementation) {
                    result.push(twin);
                }
            }
        }
        result
    }

    /// Like [`find_uses`](Self::find_uses) but in deterministic key-then-
    /// source order, for reproducible traces.
    #[must_use]
    pub fn ordered_uses(&self, id: NodeId) -> Vec<NodeId> {
        let mut uses = self.find_uses(id);
        uses.sort_by(|a, b| {
            let left = self.nodes.get(a).map(Node::stable_order);
            let right = self.nodes.get(b).map(Node::stable_order);
            left.cmp(&right).then(a.cmp(b))
        });
        uses.dedup();
        uses
    }

    /// Same as [`ordered_uses`](Self::ordered_uses) keyed directly by a
    /// def key, for seeds whose node has already been removed.
    #[must_use]
    pub fn ordered_uses_of_key(&self, key: &DependencyKey) -> Vec<NodeId> {
        let mut uses: Vec<NodeId> = self
            .uses_by_def
            .get(key)
            .into_iter()
            .flat_map(|ids| ids.iter().copied())
            .collect();
        uses.sort_by(|a, b| {
            let left = self.nodes.get(a).map(Node::stable_order);
            let right = self.nodes.get(b).map(Node::stable_order);
            left.cmp(&right).then(a.cmp(b))
        });
        uses
    }

    /// Check the cross-index invariants, panicking on violation.
    ///
    /// Every use in `uses_by_def` must be a live, non-expat node; every
    /// index entry must agree with the arena.
    pub fn verify(&self) {
        for (def, uses) in &self.uses_by_def {
            for id in uses {
                let node = self
                    .nodes
                    .get(id)
                    .unwrap_or_else(|| panic!("use of {def} references a removed node"));
                assert!(
                    !node.is_expat(),
                    "expat node {node} recorded as a use of {def}"
                );
            }
        }
        for (key, ids) in &self.ids_by_key {
            for id in ids {
                let node = self
                    .nodes
                    .get(id)
                    .unwrap_or_else(|| panic!("key index for {key} references a removed node"));
                assert_eq!(node.key(), key, "key index disagrees with arena");
            }
        }
        for (source, by_key) in &self.owned {
            for (key, id) in by_key {
                let node = self
                    .nodes
                    .get(id)
                    .unwrap_or_else(|| panic!("source index for {source} references a removed node"));
                assert_eq!(node.source(), Some(source));
                assert_eq!(node.key(), key);
            }
        }
        for (key, id) in &self.expats {
            let node = self
                .nodes
                .get(id)
                .unwrap_or_else(|| panic!("expat index for {key} references a removed node"));
            assert!(node.is_expat());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{DeclAspect, Designator};
    use crate::node::Fingerprint;

    fn key(name: &str) -> DependencyKey {
        DependencyKey::new(
            DeclAspect::Interface,
            Designator::TopLevel {
                name: name.to_owned(),
            },
        )
    }

    fn src(s: &str) -> SourcePath {
        SourcePath::from(s)
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut finder = NodeFinder::new();
        let node = Node::new(key("a"), None, Some(src("j0.kdeps")));
        assert!(finder.insert(node).is_none());

        let id = finder.node_for_source(&src("j0.kdeps"), &key("a")).unwrap();
        assert_eq!(finder.node(id).unwrap().key(), &key("a"));
        assert_eq!(finder.len(), 1);
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut finder = NodeFinder::new();
        finder.insert(Node::new(key("a"), None, Some(src("j0.kdeps"))));
        let id = finder.node_for_source(&src("j0.kdeps"), &key("a")).unwrap();

        let prior = finder.insert(Node::new(
            key("a"),
            Some(Fingerprint::new("1")),
            Some(src("j0.kdeps")),
        ));
        assert!(prior.is_some());
        assert!(prior.unwrap().fingerprint().is_none());

        // Same handle, new contents.
        let id_after = finder.node_for_source(&src("j0.kdeps"), &key("a")).unwrap();
        assert_eq!(id, id_after);
        assert!(finder.node(id_after).unwrap().fingerprint().is_some());
        assert_eq!(finder.len(), 1);
    }

    #[test]
    fn test_uses_shared_across_providers() {
        let mut finder = NodeFinder::new();
        finder.insert(Node::new(key("a"), None, Some(src("j0.kdeps"))));
        finder.insert(Node::new(key("a"), None, Some(src("j1.kdeps"))));
        finder.insert(Node::new(key("u"), None, Some(src("j2.kdeps"))));
        let user = finder.node_for_source(&src("j2.kdeps"), &key("u")).unwrap();

        assert!(finder.record_use(&key("a"), user));
        assert!(!finder.record_use(&key("a"), user));

        // Both providers of `a` see the same use-set.
        let id0 = finder.node_for_source(&src("j0.kdeps"), &key("a")).unwrap();
        let id1 = finder.node_for_source(&src("j1.kdeps"), &key("a")).unwrap();
        assert_eq!(finder.find_uses(id0), vec![user]);
        assert_eq!(finder.find_uses(id1), vec![user]);
    }

    #[test]
    fn test_remove_strips_use_sets() {
        let mut finder = NodeFinder::new();
        finder.insert(Node::new(key("a"), None, Some(src("j0.kdeps"))));
        finder.insert(Node::new(key("u"), None, Some(src("j1.kdeps"))));
        let user = finder.node_for_source(&src("j1.kdeps"), &key("u")).unwrap();
        finder.record_use(&key("a"), user);

        finder.remove(user);
        assert!(finder.uses_of_def(&key("a")).is_none());
        finder.verify();
    }

    #[test]
    fn test_expat_replacement_carries_uses() {
        let mut finder = NodeFinder::new();
        finder.insert(Node::expat(key("a")));
        finder.insert(Node::new(key("u"), None, Some(src("j1.kdeps"))));
        let user = finder.node_for_source(&src("j1.kdeps"), &key("u")).unwrap();
        finder.record_use(&key("a"), user);

        // Provider shows up for `a`: drop the expat, insert the real node.
        let expat = finder.expat_for(&key("a")).unwrap();
        finder.remove(expat);
        finder.insert(Node::new(
            key("a"),
            Some(Fingerprint::new("f")),
            Some(src("j0.kdeps")),
        ));

        let provider = finder.node_for_source(&src("j0.kdeps"), &key("a")).unwrap();
        // The use-set is keyed by key, so the new provider inherits it.
        assert_eq!(finder.find_uses(provider), vec![user]);
        finder.verify();
    }

    #[test]
    fn test_implicit_interface_implementation_edge() {
        let mut finder = NodeFinder::new();
        let iface = key("a");
        let implementation = iface.corresponding_implementation().unwrap();
        finder.insert(Node::new(iface.clone(), None, Some(src("j0.kdeps"))));
        finder.insert(Node::new(implementation.clone(), None, Some(src("j0.kdeps"))));

        let iface_id = finder.node_for_source(&src("j0.kdeps"), &iface).unwrap();
        let impl_id = finder
            .node_for_source(&src("j0.kdeps"), &implementation)
            .unwrap();

        // No arc stored, yet the twin is yielded.
        assert_eq!(finder.find_uses(iface_id), vec![impl_id]);
        // And never in the other direction.
        assert!(finder.find_uses(impl_id).is_empty());
    }

    #[test]
    fn test_ordered_uses_deterministic() {
        let mut finder = NodeFinder::new();
        finder.insert(Node::new(key("def"), None, Some(src("j0.kdeps"))));
        for source in ["j3.kdeps", "j1.kdeps", "j2.kdeps"] {
            finder.insert(Node::new(key("u"), None, Some(src(source))));
            let id = finder.node_for_source(&src(source), &key("u")).unwrap();
            finder.record_use(&key("def"), id);
        }
        let def = finder.node_for_source(&src("j0.kdeps"), &key("def")).unwrap();
        let ordered: Vec<&SourcePath> = finder
            .ordered_uses(def)
            .into_iter()
            .filter_map(|id| finder.node(id).and_then(Node::source))
            .collect();
        assert_eq!(
            ordered,
            vec![&src("j1.kdeps"), &src("j2.kdeps"), &src("j3.kdeps")]
        );
    }

    #[test]
    fn test_clear_uses_of() {
        let mut finder = NodeFinder::new();
        finder.insert(Node::new(key("u"), None, Some(src("j0.kdeps"))));
        let user = finder.node_for_source(&src("j0.kdeps"), &key("u")).unwrap();
        finder.record_use(&key("a"), user);
        finder.record_use(&key("b"), user);

        finder.clear_uses_of(user);
        assert!(finder.uses_of_def(&key("a")).is_none());
        assert!(finder.uses_of_def(&key("b")).is_none());
        finder.verify();
    }
}
