//! Per-File Dependency Graphs
//!
//! The decoded form of the dependency artifact the compiler emits next to
//! each object file. Nodes are addressed by sequence number (their index
//! in the artifact); arcs are recorded on the depending node as
//! `defs_i_depend_upon`. Slots 0 and 1 are by convention the file's own
//! source-file-provide interface and implementation nodes, and slot 0
//! carries the file-level interface fingerprint.
//!
//! The engine is agnostic to the on-disk encoding; readers live next to
//! the module-graph serializer.

use std::fmt;

use crate::key::{DeclAspect, DependencyKey, Designator};
use crate::node::Fingerprint;
use crate::paths::SourcePath;

/// Sequence number of the file-level interface node.
pub const SOURCE_FILE_INTERFACE: usize = 0;
/// Sequence number of the file-level implementation node.
pub const SOURCE_FILE_IMPLEMENTATION: usize = 1;

/// One node of a per-file graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileNode {
    pub key: DependencyKey,
    pub fingerprint: Option<Fingerprint>,
    /// Whether the file provides this key, as opposed to merely using it.
    pub is_provides: bool,
    /// Sequence numbers of the defs this node depends upon.
    pub defs_i_depend_upon: Vec<usize>,
}

/// The decoded dependency artifact for one source file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceFileDepGraph {
    nodes: Vec<SourceFileNode>,
}

impl SourceFileDepGraph {
    /// Start a graph for `source`, creating the file-level pair in slots
    /// 0 and 1. The interface slot carries the file-level fingerprint.
    #[must_use]
    pub fn new(source: &SourcePath, interface_fingerprint: Option<Fingerprint>) -> Self {
        let mut graph = SourceFileDepGraph { nodes: Vec::new() };
        graph.nodes.push(SourceFileNode {
            key: DependencyKey::source_file_provide(DeclAspect::Interface, source.as_str()),
            fingerprint: interface_fingerprint,
            is_provides: true,
            defs_i_depend_upon: Vec::new(),
        });
        graph.nodes.push(SourceFileNode {
            key: DependencyKey::source_file_provide(DeclAspect::Implementation, source.as_str()),
            fingerprint: None,
            is_provides: true,
            defs_i_depend_upon: Vec::new(),
        });
        graph
    }

    /// Rebuild from raw nodes, e.g. out of a decoded artifact.
    pub fn from_nodes(nodes: Vec<SourceFileNode>) -> Result<Self, SourceFileGraphError> {
        let graph = SourceFileDepGraph { nodes };
        graph.validate()?;
        Ok(graph)
    }

    /// Append a node; returns its sequence number.
    pub fn add_node(
        &mut self,
        key: DependencyKey,
        fingerprint: Option<Fingerprint>,
        is_provides: bool,
    ) -> usize {
        let seq = self.nodes.len();
        self.nodes.push(SourceFileNode {
            key,
            fingerprint,
            is_provides,
            defs_i_depend_upon: Vec::new(),
        });
        seq
    }

    /// Record an intra-file arc `def → use`.
    pub fn add_arc(&mut self, def: usize, use_: usize) {
        let deps = &mut self.nodes[use_].defs_i_depend_upon;
        if !deps.contains(&def) {
            deps.push(def);
        }
    }

    #[must_use]
    pub fn nodes(&self) -> &[SourceFileNode] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, seq: usize) -> Option<&SourceFileNode> {
        self.nodes.get(seq)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The dependency-artifact path this graph describes, from slot 0.
    pub fn source(&self) -> Result<SourcePath, SourceFileGraphError> {
        match self.nodes.first() {
            Some(SourceFileNode {
                key:
                    DependencyKey {
                        aspect: DeclAspect::Interface,
                        designator: Designator::SourceFileProvide { name },
                    },
                ..
            }) => Ok(SourcePath::new(name.clone())),
            _ => Err(SourceFileGraphError::MissingFileLevelPair),
        }
    }

    /// The file-level interface fingerprint, if the compiler emitted one.
    #[must_use]
    pub fn interface_fingerprint(&self) -> Option<&Fingerprint> {
        self.nodes
            .get(SOURCE_FILE_INTERFACE)
            .and_then(|n| n.fingerprint.as_ref())
    }

    /// Check the slot conventions and arc ranges.
    pub fn validate(&self) -> Result<(), SourceFileGraphError> {
        let source = self.source()?;
        let implementation = self
            .nodes
            .get(SOURCE_FILE_IMPLEMENTATION)
            .ok_or(SourceFileGraphError::MissingFileLevelPair)?;
        let expected =
            DependencyKey::source_file_provide(DeclAspect::Implementation, source.as_str());
        if implementation.key != expected || !implementation.is_provides {
            return Err(SourceFileGraphError::MissingFileLevelPair);
        }
        for (seq, node) in self.nodes.iter().enumerate() {
            for &def in &node.defs_i_depend_upon {
                if def >= self.nodes.len() {
                    return Err(SourceFileGraphError::ArcOutOfRange { seq, def });
                }
            }
        }
        Ok(())
    }
}

/// Error validating a decoded per-file graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFileGraphError {
    /// Slots 0 and 1 are not the file-level provide pair.
    MissingFileLevelPair,
    /// A `defs_i_depend_upon` entry points past the node list.
    ArcOutOfRange { seq: usize, def: usize },
}

impl fmt::Display for SourceFileGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceFileGraphError::MissingFileLevelPair => {
                f.write_str("per-file graph lacks its file-level provide pair in slots 0 and 1")
            }
            SourceFileGraphError::ArcOutOfRange { seq, def } => {
                write!(f, "node {seq} depends on out-of-range def {def}")
            }
        }
    }
}

impl std::error::Error for SourceFileGraphError {}
