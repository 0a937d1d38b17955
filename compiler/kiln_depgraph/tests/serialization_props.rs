//! Property-based tests for graph serialization and tracing.
//!
//! Random universes of mock jobs are loaded into a graph; the serialized
//! form must round-trip to a matching graph, and the recompilation
//! queries must stay reflexive on first call and empty on repeat calls.

use proptest::prelude::*;

use kiln_depgraph::serialize::{deserialize_module_graph, serialize_module_graph};
use kiln_depgraph::testing::{mock_input, mock_source, simulate_load, MockKind};
use kiln_depgraph::ModuleDepGraph;

/// One mock job: provided names with optional fingerprints, plus
/// depended-upon names with a cascading flag.
type JobDescription = (Vec<(String, Option<u8>)>, Vec<(String, bool)>);

fn arb_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-e]").expect("valid regex")
}

fn arb_job() -> impl Strategy<Value = JobDescription> {
    (
        prop::collection::vec((arb_name(), prop::option::of(0u8..4)), 0..3),
        prop::collection::vec((arb_name(), any::<bool>()), 0..3),
    )
}

fn build_graph(jobs: &[JobDescription]) -> ModuleDepGraph {
    let mut graph = ModuleDepGraph::new("kiln proptest");
    for (i, (provides, depends)) in jobs.iter().enumerate() {
        let mut entries: Vec<String> = Vec::new();
        for (name, fingerprint) in provides {
            match fingerprint {
                Some(fp) => entries.push(format!("{name}@{fp}")),
                None => entries.push(name.clone()),
            }
        }
        for (name, cascading) in depends {
            if *cascading {
                entries.push(format!("{name}->"));
            } else {
                entries.push(format!("#{name}->"));
            }
        }
        let entry_refs: Vec<&str> = entries.iter().map(String::as_str).collect();
        simulate_load(&mut graph, i, &[(MockKind::TopLevel, &entry_refs)]);
    }
    graph
}

proptest! {
    #[test]
    fn prop_serialization_round_trips(jobs in prop::collection::vec(arb_job(), 1..5)) {
        let graph = build_graph(&jobs);
        let bytes = serialize_module_graph(&graph);
        let mut restored = deserialize_module_graph(&bytes).expect("round-trip read");
        // The input↔source map comes from the output-file map, not the
        // graph file; re-register as the driver would.
        for i in 0..jobs.len() {
            restored.register_input(mock_input(i), mock_source(i));
        }
        prop_assert!(restored.matches(&graph));
        restored.verify();
    }

    #[test]
    fn prop_serialization_is_deterministic(jobs in prop::collection::vec(arb_job(), 1..5)) {
        let first = serialize_module_graph(&build_graph(&jobs));
        let second = serialize_module_graph(&build_graph(&jobs));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_queries_reflexive_then_idempotent(
        jobs in prop::collection::vec(arb_job(), 1..5),
        which in 0usize..4,
    ) {
        let mut graph = build_graph(&jobs);
        let input = mock_input(which % jobs.len());

        let first = graph.find_inputs_to_recompile_when_input_changes(&input);
        prop_assert!(first.contains(&input));
        let second = graph.find_inputs_to_recompile_when_input_changes(&input);
        prop_assert!(second.is_empty());
    }

    #[test]
    fn prop_tracing_never_corrupts_indexes(jobs in prop::collection::vec(arb_job(), 1..5)) {
        let mut graph = build_graph(&jobs);
        for i in 0..jobs.len() {
            graph.find_inputs_to_recompile_when_input_changes(&mock_input(i));
        }
        graph.verify();
    }
}
