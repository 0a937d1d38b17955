//! Module Dependency Graph
//!
//! The persistent graph the driver consults between and during builds.
//! Owns the node finder, the per-session traced set, the input↔source
//! map, and the set of known external dependencies. All mutation happens
//! on the driver's control thread; there is no interior locking.
//!
//! The recompilation queries share one shape: seed the tracer, then map
//! the nodes it visited back to inputs. Whole-job queries map every newly
//! traced node including the seeds (which makes the first call reflexive
//! and later calls empty); node-change queries discard the seeds, since
//! the file that produced them has just been compiled.

use std::collections::BTreeSet;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::finder::{NodeFinder, NodeId};
use crate::integrator::{self, Integration};
use crate::key::DependencyKey;
use crate::node::Node;
use crate::paths::{InputPath, SourcePath};
use crate::source_file_graph::{SourceFileDepGraph, SourceFileGraphError};
use crate::tracer;

/// The module-level dependency graph, persisted across driver invocations.
#[derive(Debug, Default)]
pub struct ModuleDepGraph {
    pub(crate) finder: NodeFinder,
    /// Nodes the tracer has visited this session. Never persisted.
    pub(crate) traced: FxHashSet<NodeId>,
    pub(crate) inputs_by_source: FxHashMap<SourcePath, InputPath>,
    pub(crate) sources_by_input: FxHashMap<InputPath, SourcePath>,
    pub(crate) external_deps: FxHashSet<String>,
    /// Version string recorded in the persisted metadata record.
    pub(crate) compiler_version: String,
}

impl ModuleDepGraph {
    #[must_use]
    pub fn new(compiler_version: impl Into<String>) -> Self {
        ModuleDepGraph {
            compiler_version: compiler_version.into(),
            ..ModuleDepGraph::default()
        }
    }

    /// Associate an input file with its dependency artifact.
    ///
    /// Established at initialization from the output-file map; both
    /// directions are needed, so both are stored.
    pub fn register_input(&mut self, input: InputPath, source: SourcePath) {
        self.inputs_by_source.insert(source.clone(), input.clone());
        self.sources_by_input.insert(input, source);
    }

    #[must_use]
    pub fn source_for(&self, input: &InputPath) -> Option<&SourcePath> {
        self.sources_by_input.get(input)
    }

    #[must_use]
    pub fn input_for(&self, source: &SourcePath) -> Option<&InputPath> {
        self.inputs_by_source.get(source)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.finder.len()
    }

    /// Known external dependency paths, sorted.
    #[must_use]
    pub fn external_dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = self.external_deps.iter().map(String::as_str).collect();
        deps.sort_unstable();
        deps
    }

    pub fn add_external_dependency(&mut self, path: impl Into<String>) {
        self.external_deps.insert(path.into());
    }

    /// Snapshots of the nodes owned by `source`, sorted by key.
    #[must_use]
    pub fn nodes_for_source(&self, source: &SourcePath) -> Vec<Node> {
        self.finder
            .nodes_owned_by(source)
            .into_iter()
            .filter_map(|id| self.finder.node(id).cloned())
            .collect()
    }

    /// Fold a freshly emitted per-file graph into this graph.
    ///
    /// Returns the invalidated-node snapshots for the second wave and
    /// records any newly discovered external dependencies.
    pub fn integrate(
        &mut self,
        source_graph: &SourceFileDepGraph,
    ) -> Result<Integration, SourceFileGraphError> {
        let integration = integrator::integrate(&mut self.finder, &self.external_deps, source_graph)?;
        for path in &integration.discovered_external_deps {
            self.external_deps.insert(path.clone());
        }
        Ok(integration)
    }

    /// Every input that must recompile if `input` changes in full.
    ///
    /// Reflexive on the first call (whenever the input owns any nodes)
    /// and empty on repeat calls, because the traced flags persist for
    /// the session.
    pub fn find_inputs_to_recompile_when_input_changes(
        &mut self,
        input: &InputPath,
    ) -> BTreeSet<InputPath> {
        let Some(source) = self.sources_by_input.get(input) else {
            tracing::warn!(input = %input, "recompile query for unknown input");
            return BTreeSet::new();
        };
        let seeds = self.nodes_for_source(&source.clone());
        let result = tracer::trace_from(&self.finder, &mut self.traced, &seeds);
        let mut ids = result.newly_traced_seeds;
        ids.extend(result.reached);
        self.inputs_of(&ids)
    }

    /// Every input invalidated by the given changed nodes.
    ///
    /// The seeds themselves are discarded when mapping back to inputs;
    /// only what the trace newly reached counts.
    pub fn find_inputs_to_recompile_when_nodes_change(
        &mut self,
        nodes: &[Node],
    ) -> BTreeSet<InputPath> {
        let sources = self.collect_sources_transitively_invalidated_by(nodes);
        sources
            .iter()
            .filter_map(|source| self.inputs_by_source.get(source).cloned())
            .collect()
    }

    /// Sources owning nodes the trace newly reached from `nodes`.
    ///
    /// The primary entry for the scheduler's second wave. The changed
    /// nodes' dependents must be revisited even if an earlier query
    /// already traced them, so their traced flags are cleared first.
    pub fn collect_sources_transitively_invalidated_by(
        &mut self,
        nodes: &[Node],
    ) -> BTreeSet<SourcePath> {
        self.ensure_will_retrace_dependents_of(nodes);
        let result = tracer::trace_from(&self.finder, &mut self.traced, nodes);
        result
            .reached
            .iter()
            .filter_map(|id| self.finder.node(*id))
            .filter_map(|node| node.source().cloned())
            .collect()
    }

    /// Whether any node owned by `input` has been traced this session.
    #[must_use]
    pub fn have_any_nodes_been_traced_in(&self, input: &InputPath) -> bool {
        let Some(source) = self.sources_by_input.get(input) else {
            return false;
        };
        self.finder
            .nodes_owned_by(source)
            .iter()
            .any(|id| self.traced.contains(id))
    }

    /// Inputs reachable from the untraced uses of an external dependency.
    ///
    /// Gathers the untraced nodes keyed `externalDepend(path)` at
    /// interface aspect, traces from them, and maps everything newly
    /// visited back to inputs. Once the dependents are traced, repeat
    /// calls return nothing.
    pub fn find_externally_dependent_untraced_inputs(
        &mut self,
        path: &str,
    ) -> BTreeSet<InputPath> {
        let key = DependencyKey::interface_for_external_depend(path);
        let seeds: Vec<Node> = self
            .finder
            .ids_for_key(&key)
            .filter(|id| !self.traced.contains(id))
            .filter_map(|id| self.finder.node(id).cloned())
            .collect();
        let result = tracer::trace_from(&self.finder, &mut self.traced, &seeds);
        let mut ids = result.newly_traced_seeds;
        ids.extend(result.reached);
        self.inputs_of(&ids)
    }

    /// Clear the traced flag on the given nodes and on everything
    /// downstream of them, so a later trace will re-propagate.
    ///
    /// Without this, a node whose dependents were traced by an earlier
    /// query would change again and the new invalidation would stop dead
    /// at the stale traced flags.
    pub fn ensure_will_retrace_dependents_of(&mut self, nodes: &[Node]) {
        let mut worklist: Vec<NodeId> = Vec::new();
        let mut visited: FxHashSet<NodeId> = FxHashSet::default();
        for node in nodes {
            let id = match node.source() {
                Some(source) => self.finder.node_for_source(source, node.key()),
                None => self.finder.expat_for(node.key()),
            };
            match id {
                Some(id) => {
                    if visited.insert(id) {
                        worklist.push(id);
                    }
                }
                None => {
                    // Removed node: clear through its key-indexed uses.
                    for use_id in self.finder.ordered_uses_of_key(node.key()) {
                        if visited.insert(use_id) {
                            worklist.push(use_id);
                        }
                    }
                }
            }
        }
        while let Some(id) = worklist.pop() {
            self.traced.remove(&id);
            for use_id in self.finder.find_uses(id) {
                if visited.insert(use_id) {
                    worklist.push(use_id);
                }
            }
        }
    }

    /// Structural equality over everything the serializer persists:
    /// nodes, use arcs, the input↔source map, and external dependencies.
    ///
    /// The traced set is deliberately ignored; it is session state.
    #[must_use]
    pub fn matches(&self, other: &ModuleDepGraph) -> bool {
        self.sorted_nodes() == other.sorted_nodes()
            && self.sorted_uses() == other.sorted_uses()
            && self.sources_by_input == other.sources_by_input
            && self.external_deps == other.external_deps
    }

    /// Check the finder's cross-index invariants; panics on violation.
    pub fn verify(&self) {
        self.finder.verify();
    }

    fn sorted_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.finder.all_nodes().map(|(_, n)| n.clone()).collect();
        nodes.sort_by(|a, b| a.stable_order().cmp(&b.stable_order()));
        nodes
    }

    fn sorted_uses(&self) -> Vec<(DependencyKey, Vec<Node>)> {
        let mut uses: Vec<(DependencyKey, Vec<Node>)> = self
            .finder
            .def_keys()
            .map(|def| {
                let mut users: Vec<Node> = self
                    .finder
                    .uses_of_def(def)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.finder.node(*id).cloned())
                    .collect();
                users.sort_by(|a, b| a.stable_order().cmp(&b.stable_order()));
                (def.clone(), users)
            })
            .collect();
        uses.sort_by(|a, b| a.0.cmp(&b.0));
        uses
    }

    fn inputs_of(&self, ids: &[NodeId]) -> BTreeSet<InputPath> {
        ids.iter()
            .filter_map(|id| self.finder.node(*id))
            .filter_map(Node::source)
            .filter_map(|source| self.inputs_by_source.get(source).cloned())
            .collect()
    }
}
