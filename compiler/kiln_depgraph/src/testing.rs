//! Mock Dependency Descriptions
//!
//! Builds per-file graphs from a compact text form so graph behavior can
//! be exercised without a compiler. The syntax, per entry:
//!
//! - `name` — the file provides `name`
//! - `name@fp` — provides `name` with fingerprint `fp`
//! - `name->` — the file depends on `name` (cascading)
//! - `#name->` — file-private depend on `name` (non-cascading)
//!
//! Member names are written `context,name`. Mock inputs are `j0.kiln`,
//! `j1.kiln`, ... with artifacts `j0.kdeps`, `j1.kdeps`, ...
//!
//! The generated artifact has the same shape the compiler emits: slots 0
//! and 1 are the file-level pair, slot 0's fingerprint covers the whole
//! description, each provided decl's interface node depends on slot 0,
//! cascading depends arc into slot 0 and non-cascading ones into slot 1.

use std::collections::BTreeSet;

use crate::graph::ModuleDepGraph;
use crate::integrator::Integration;
use crate::key::{DeclAspect, DependencyKey, Designator};
use crate::node::Fingerprint;
use crate::paths::{InputPath, SourcePath};
use crate::source_file_graph::{
    SourceFileDepGraph, SOURCE_FILE_IMPLEMENTATION, SOURCE_FILE_INTERFACE,
};

/// Designator kinds expressible in mock descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockKind {
    TopLevel,
    Nominal,
    PotentialMember,
    Member,
    DynamicLookup,
    ExternalDepend,
}

impl MockKind {
    fn designator(self, name: &str) -> Designator {
        match self {
            MockKind::TopLevel => Designator::TopLevel {
                name: name.to_owned(),
            },
            MockKind::Nominal => Designator::Nominal {
                context: name.to_owned(),
            },
            MockKind::PotentialMember => Designator::PotentialMember {
                context: name.to_owned(),
            },
            MockKind::Member => {
                let (context, member) = name.split_once(',').unwrap_or((name, ""));
                Designator::Member {
                    context: context.to_owned(),
                    name: member.to_owned(),
                }
            }
            MockKind::DynamicLookup => Designator::DynamicLookup {
                name: name.to_owned(),
            },
            MockKind::ExternalDepend => Designator::ExternalDepend {
                path: name.to_owned(),
            },
        }
    }
}

/// The mock input path for job `i`.
#[must_use]
pub fn mock_input(i: usize) -> InputPath {
    InputPath::new(format!("j{i}.kiln"))
}

/// The mock dependency-artifact path for job `i`.
#[must_use]
pub fn mock_source(i: usize) -> SourcePath {
    SourcePath::new(format!("j{i}.kdeps"))
}

struct MockEntry<'a> {
    name: &'a str,
    fingerprint: Option<&'a str>,
    is_depend: bool,
    non_cascading: bool,
}

fn parse_entry(raw: &str) -> MockEntry<'_> {
    let (non_cascading, rest) = match raw.strip_prefix('#') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (is_depend, rest) = match rest.strip_suffix("->") {
        Some(rest) => (true, rest),
        None => (false, rest),
    };
    let (name, fingerprint) = match rest.split_once('@') {
        Some((name, fp)) => (name, Some(fp)),
        None => (rest, None),
    };
    MockEntry {
        name,
        fingerprint,
        is_depend,
        non_cascading,
    }
}

/// Build the per-file graph for one mock description.
#[must_use]
pub fn mock_source_graph(
    source: &SourcePath,
    descriptions: &[(MockKind, &[&str])],
) -> SourceFileDepGraph {
    let content: Vec<String> = descriptions
        .iter()
        .map(|(kind, entries)| format!("{kind:?}:{}", entries.join(";")))
        .collect();
    let mut graph =
        SourceFileDepGraph::new(source, Some(Fingerprint::new(content.join("|"))));

    for (kind, entries) in descriptions {
        for raw in *entries {
            let entry = parse_entry(raw);
            let designator = kind.designator(entry.name);
            if entry.is_depend {
                let seq = graph.add_node(
                    DependencyKey::new(DeclAspect::Interface, designator),
                    None,
                    false,
                );
                let use_slot = if entry.non_cascading {
                    SOURCE_FILE_IMPLEMENTATION
                } else {
                    SOURCE_FILE_INTERFACE
                };
                graph.add_arc(seq, use_slot);
            } else {
                let fingerprint = entry.fingerprint.map(Fingerprint::new);
                let interface = graph.add_node(
                    DependencyKey::new(DeclAspect::Interface, designator.clone()),
                    fingerprint.clone(),
                    true,
                );
                graph.add_arc(SOURCE_FILE_INTERFACE, interface);
                graph.add_node(
                    DependencyKey::new(DeclAspect::Implementation, designator),
                    fingerprint,
                    true,
                );
            }
        }
    }
    graph
}

/// Register job `i` and integrate its mock description.
pub fn simulate_load(
    graph: &mut ModuleDepGraph,
    i: usize,
    descriptions: &[(MockKind, &[&str])],
) -> Integration {
    let source = mock_source(i);
    graph.register_input(mock_input(i), source.clone());
    let file_graph = mock_source_graph(&source, descriptions);
    graph
        .integrate(&file_graph)
        .expect("mock per-file graph must integrate")
}

/// Re-integrate job `i` with a new description and return the inputs the
/// change invalidates, as the second wave would compute them.
pub fn simulate_reload(
    graph: &mut ModuleDepGraph,
    i: usize,
    descriptions: &[(MockKind, &[&str])],
) -> BTreeSet<InputPath> {
    let integration = simulate_load(graph, i, descriptions);
    graph.find_inputs_to_recompile_when_nodes_change(&integration.invalidated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry_forms() {
        let plain = parse_entry("a");
        assert_eq!(plain.name, "a");
        assert!(!plain.is_depend && !plain.non_cascading);
        assert!(plain.fingerprint.is_none());

        let fp = parse_entry("A1@11");
        assert_eq!(fp.name, "A1");
        assert_eq!(fp.fingerprint, Some("11"));

        let depend = parse_entry("b->");
        assert!(depend.is_depend);
        assert!(!depend.non_cascading);

        let private = parse_entry("#b->");
        assert!(private.is_depend);
        assert!(private.non_cascading);
    }

    #[test]
    fn test_mock_graph_shape() {
        let graph = mock_source_graph(
            &mock_source(0),
            &[(MockKind::TopLevel, &["a@1", "b->", "#c->"])],
        );
        graph.validate().unwrap();
        // File pair, decl pair, two depend nodes.
        assert_eq!(graph.len(), 6);

        // The decl's interface node hangs off slot 0.
        assert_eq!(graph.node(2).unwrap().defs_i_depend_upon, vec![0]);
        // Cascading depend arcs into slot 0, private depend into slot 1.
        assert!(graph.node(0).unwrap().defs_i_depend_upon.contains(&4));
        assert!(graph.node(1).unwrap().defs_i_depend_upon.contains(&5));
    }

    #[test]
    fn test_description_change_moves_file_fingerprint() {
        let before = mock_source_graph(&mock_source(0), &[(MockKind::Nominal, &["A1@1"])]);
        let after = mock_source_graph(&mock_source(0), &[(MockKind::Nominal, &["A1@11"])]);
        assert_ne!(before.interface_fingerprint(), after.interface_fingerprint());
    }
}
