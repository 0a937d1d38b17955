//! Integrator
//!
//! Folds a per-file dependency graph into the module graph, detecting what
//! changed. The result carries snapshots of every invalidated node (the
//! tracer's seed set) plus any external dependencies seen for the first
//! time.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::finder::{NodeFinder, NodeId};
use crate::key::{DeclAspect, DependencyKey};
use crate::node::Node;
use crate::paths::SourcePath;
use crate::source_file_graph::{
    SourceFileDepGraph, SourceFileGraphError, SOURCE_FILE_INTERFACE,
};

/// What one integration changed.
#[derive(Debug, Default)]
pub struct Integration {
    /// Snapshots of nodes that appeared, changed fingerprint, or
    /// disappeared. Disappeared nodes are already removed from the graph;
    /// the tracer expands them through their key-indexed use-sets.
    pub invalidated: Vec<Node>,
    /// External dependency paths not previously known to the graph.
    pub discovered_external_deps: Vec<String>,
}

/// Fold `source_graph` into the module graph.
///
/// `known_external_deps` is consulted for discovery only; the caller owns
/// adding the discovered paths to the known set.
pub(crate) fn integrate(
    finder: &mut NodeFinder,
    known_external_deps: &FxHashSet<String>,
    source_graph: &SourceFileDepGraph,
) -> Result<Integration, SourceFileGraphError> {
    source_graph.validate()?;
    let source = source_graph.source()?;

    let pre_existing: FxHashSet<NodeId> = finder.nodes_owned_by(&source).into_iter().collect();

    let mut result = Integration::default();
    let mut invalidated_ids: FxHashSet<NodeId> = FxHashSet::default();
    let mut claimed: FxHashSet<NodeId> = FxHashSet::default();
    let mut keys_claimed: FxHashMap<DependencyKey, NodeId> = FxHashMap::default();
    let mut by_seq: FxHashMap<usize, NodeId> = FxHashMap::default();
    let mut file_interface_changed = false;

    // Pass 1: integrate every provides node.
    for (seq, integrand) in source_graph.nodes().iter().enumerate() {
        if !integrand.is_provides {
            continue;
        }

        if let Some(&prior_id) = keys_claimed.get(&integrand.key) {
            // Two providers of one key within one file. They cannot
            // coexist, so the fingerprint is erased: any change on either
            // side will now invalidate users.
            let prior = match finder.node(prior_id) {
                Some(node) => node.clone(),
                None => continue,
            };
            if prior.fingerprint() != integrand.fingerprint.as_ref() {
                let erased = Node::new(integrand.key.clone(), None, Some(source.clone()));
                finder.insert(erased.clone());
                if invalidated_ids.insert(prior_id) {
                    result.invalidated.push(erased);
                }
            }
            by_seq.insert(seq, prior_id);
            continue;
        }

        let id = if let Some(id) = finder.node_for_source(&source, &integrand.key) {
            // Was here before; arcs get re-recorded from the fresh graph.
            finder.clear_uses_of(id);
            let fingerprint_changed = finder
                .node(id)
                .is_some_and(|prior| prior.fingerprint() != integrand.fingerprint.as_ref());
            if fingerprint_changed {
                let replacement = Node::new(
                    integrand.key.clone(),
                    integrand.fingerprint.clone(),
                    Some(source.clone()),
                );
                finder.insert(replacement.clone());
                if invalidated_ids.insert(id) {
                    result.invalidated.push(replacement);
                }
                if seq == SOURCE_FILE_INTERFACE {
                    file_interface_changed = true;
                }
            }
            id
        } else if let Some(expat_id) = finder.expat_for(&integrand.key) {
            // A file now provides what was only externally referenced.
            // Uses carry over because the def→use index is keyed by key.
            finder.remove(expat_id);
            let replacement = Node::new(
                integrand.key.clone(),
                integrand.fingerprint.clone(),
                Some(source.clone()),
            );
            finder.insert(replacement.clone());
            let id = match finder.node_for_source(&source, &integrand.key) {
                Some(id) => id,
                None => continue,
            };
            if invalidated_ids.insert(id) {
                result.invalidated.push(replacement);
            }
            id
        } else {
            let fresh = Node::new(
                integrand.key.clone(),
                integrand.fingerprint.clone(),
                Some(source.clone()),
            );
            finder.insert(fresh.clone());
            let id = match finder.node_for_source(&source, &integrand.key) {
                Some(id) => id,
                None => continue,
            };
            if invalidated_ids.insert(id) {
                result.invalidated.push(fresh);
            }
            id
        };

        claimed.insert(id);
        keys_claimed.insert(integrand.key.clone(), id);
        by_seq.insert(seq, id);
    }

    // A changed file-level interface fingerprint also invalidates the
    // file-level implementation node.
    if file_interface_changed {
        let implementation_key =
            DependencyKey::source_file_provide(DeclAspect::Implementation, source.as_str());
        if let Some(id) = finder.node_for_source(&source, &implementation_key) {
            if invalidated_ids.insert(id) {
                if let Some(node) = finder.node(id) {
                    result.invalidated.push(node.clone());
                }
            }
        }
    }

    // Pass 2: record arcs. The def side is the key; the use side must be
    // a node owned by this source.
    let mut discovered: FxHashSet<String> = FxHashSet::default();
    for (seq, integrand) in source_graph.nodes().iter().enumerate() {
        if integrand.defs_i_depend_upon.is_empty() {
            continue;
        }
        let Some(&use_id) = by_seq.get(&seq) else {
            // A pure use cannot be the use end of an arc.
            continue;
        };
        let use_is_file_level = integrand.key.is_source_file_provide();

        for &def_seq in &integrand.defs_i_depend_upon {
            let Some(def) = source_graph.node(def_seq) else {
                continue;
            };
            // A def provided by this same file must not arc into the
            // file-level node; that would let any interface change dirty
            // the whole file and defeat fingerprints.
            if use_is_file_level && def.is_provides {
                continue;
            }

            if let crate::key::Designator::ExternalDepend { path } = &def.key.designator {
                if !known_external_deps.contains(path) && discovered.insert(path.clone()) {
                    result.discovered_external_deps.push(path.clone());
                }
            }

            // Ensure the def key has at least one node so later providers
            // can claim its uses. A pure reference becomes an expat.
            if def.is_provides {
                // Integrated in pass 1.
            } else if finder.ids_for_key(&def.key).next().is_none() {
                finder.insert(Node::expat(def.key.clone()));
            }

            finder.record_use(&def.key, use_id);
        }
    }

    // Pass 3: what the file no longer declares disappears, along with the
    // arcs that used it.
    let mut disappeared: Vec<NodeId> = pre_existing
        .into_iter()
        .filter(|id| !claimed.contains(id))
        .collect();
    disappeared.sort();
    for id in disappeared {
        if let Some(node) = finder.remove(id) {
            if invalidated_ids.insert(id) {
                result.invalidated.push(node);
            }
        }
    }

    tracing::debug!(
        source = %source,
        invalidated = result.invalidated.len(),
        new_external_deps = result.discovered_external_deps.len(),
        "integrated per-file graph"
    );
    Ok(result)
}
