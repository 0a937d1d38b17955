//! Fine-Grained Module Dependency Graph
//!
//! The incremental-recompilation engine of the Kiln driver. The compiler
//! emits a per-file dependency artifact (`.kdeps`) alongside each object;
//! this crate folds those artifacts into a module-wide def→use graph,
//! traces invalidation through it, and persists it between builds.
//!
//! # Data Flow
//!
//! ```text
//! .kdeps artifact ──▶ SourceFileDepGraph ──▶ integrate()
//!                                                │
//!                                      invalidated nodes
//!                                                │
//!                                                ▼
//!                              Tracer (def→use closure, traced flags)
//!                                                │
//!                                                ▼
//!                          inputs to recompile (driver's second wave)
//! ```
//!
//! The graph is single-writer: all integration and tracing runs on the
//! driver's control thread. Persistence is explicit via
//! [`serialize::write_module_graph`] and read back with
//! [`serialize::read_module_graph`].

pub mod bitstream;
pub mod finder;
pub mod graph;
pub mod integrator;
pub mod interner;
pub mod key;
pub mod node;
pub mod paths;
pub mod serialize;
pub mod source_file_graph;
pub mod testing;
pub mod tracer;

pub use finder::{NodeFinder, NodeId};
pub use graph::ModuleDepGraph;
pub use integrator::Integration;
pub use interner::{Identifier, IdentifierTable};
pub use key::{DeclAspect, DependencyKey, Designator};
pub use node::{Fingerprint, Node};
pub use paths::{InputPath, SourcePath};
pub use serialize::{
    read_module_graph, read_source_file_graph, write_module_graph, write_source_file_graph,
    GraphReadError, GraphWriteError,
};
pub use source_file_graph::{SourceFileDepGraph, SourceFileGraphError, SourceFileNode};
