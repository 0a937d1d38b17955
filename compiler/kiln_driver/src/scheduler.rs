//! Incremental Scheduler
//!
//! Turns graph answers into compile waves. The *first wave* is chosen up
//! front: inputs whose build-record status demands a rebuild, inputs
//! downstream of changed external dependencies, and the speculative
//! expansion of cascading rebuilds. Everything else starts out skipped.
//! As each compile job finishes, its freshly emitted `.kdeps` artifact is
//! integrated back into the module graph; skipped inputs the integration
//! invalidates are promoted into the *second wave*.
//!
//! Job completions are delivered serially by the driver's process monitor,
//! so completion handling is guarded by an assertion rather than a lock.
//! A counting semaphore is signalled when the first wave drains; the
//! dispatch loop waits on it before launching the second wave.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::SystemTime;

use kiln_depgraph::serialize::{read_module_graph, read_source_file_graph, write_module_graph};
use kiln_depgraph::{InputPath, ModuleDepGraph, SourcePath};

use crate::build_record::{BuildRecord, BuildRecordError, InputStatus};
use crate::output_map::OutputFileMap;

/// Counting semaphore, initial value 0.
///
/// Signalled when the first wave drains; extra signals are harmless.
struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            count: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self
                .cond
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }
}

/// Where the scheduler's persisted state lives.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub build_record_path: PathBuf,
    pub graph_path: PathBuf,
    pub compiler_version: String,
}

/// The scheduler's opening move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirstWave {
    /// Inputs to compile now, sorted by path.
    pub to_compile: Vec<InputPath>,
    /// Inputs held back pending second-wave discoveries, sorted by path.
    pub skipped: Vec<InputPath>,
}

/// Error handling a finished compile job.
#[derive(Debug)]
pub enum JobCompletionError {
    /// The input was never registered with the scheduler.
    UnknownInput { input: InputPath },
    /// The compiler's dependency artifact is unreadable; the module graph
    /// was left unmodified and the input must fall back to a full build.
    MissingDependencyArtifact {
        input: InputPath,
        source: SourcePath,
        message: String,
    },
    /// An incremental-capable external dependency's artifact failed to
    /// integrate; the graph cannot be trusted for this cycle.
    ExternalRecursionFailed { path: String, message: String },
}

impl fmt::Display for JobCompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobCompletionError::UnknownInput { input } => {
                write!(f, "unknown input '{input}'")
            }
            JobCompletionError::MissingDependencyArtifact {
                input,
                source,
                message,
            } => write!(
                f,
                "dependency artifact '{source}' for '{input}' unusable: {message}"
            ),
            JobCompletionError::ExternalRecursionFailed { path, message } => {
                write!(f, "external dependency '{path}' failed to integrate: {message}")
            }
        }
    }
}

impl std::error::Error for JobCompletionError {}

/// Drives incremental recompilation across one build.
pub struct IncrementalScheduler {
    config: SchedulerConfig,
    graph: ModuleDepGraph,
    prior_record: Option<BuildRecord>,
    inputs: Vec<InputPath>,
    /// Inputs with no dependency-artifact mapping; compiled every build.
    always_compile: BTreeSet<InputPath>,
    skipped: BTreeSet<InputPath>,
    incomplete_first_wave: BTreeSet<InputPath>,
    second_wave: BTreeSet<InputPath>,
    completed: BTreeSet<InputPath>,
    first_wave_drained: Semaphore,
    /// Job-completion callbacks are documented serial; assert it.
    handling_completion: AtomicBool,
}

impl IncrementalScheduler {
    /// Load prior state and register the build's inputs.
    ///
    /// Any failure reading the build record or the persisted graph, and
    /// any record flagged graph-invalid, downgrades the whole build to
    /// non-incremental: a fresh graph and no prior record.
    pub fn new(config: SchedulerConfig, output_map: &OutputFileMap, inputs: Vec<InputPath>) -> Self {
        let prior_record = match BuildRecord::load(&config.build_record_path) {
            Ok(record) if record.graph_is_valid => Some(record),
            Ok(_) => {
                tracing::info!("previous graph flagged invalid; full rebuild");
                None
            }
            Err(err) => {
                tracing::debug!(error = %err, "no usable build record; full rebuild");
                None
            }
        };

        let graph = if prior_record.is_some() {
            match read_module_graph(&config.graph_path) {
                Ok(graph) => Some(graph),
                Err(err) => {
                    tracing::warn!(error = %err, "discarding persisted dependency graph");
                    None
                }
            }
        } else {
            None
        };
        // A record without a graph is useless; keep the two in lockstep.
        let prior_record = if graph.is_some() { prior_record } else { None };
        let mut graph = graph.unwrap_or_else(|| ModuleDepGraph::new(config.compiler_version.clone()));

        let mut always_compile = BTreeSet::new();
        for input in &inputs {
            match output_map.deps_path_for(input) {
                Some(source) => graph.register_input(input.clone(), source),
                None => {
                    tracing::warn!(input = %input, "no dependency artifact mapped; always compiling");
                    always_compile.insert(input.clone());
                }
            }
        }

        IncrementalScheduler {
            config,
            graph,
            prior_record,
            inputs,
            always_compile,
            skipped: BTreeSet::new(),
            incomplete_first_wave: BTreeSet::new(),
            second_wave: BTreeSet::new(),
            completed: BTreeSet::new(),
            first_wave_drained: Semaphore::new(),
            handling_completion: AtomicBool::new(false),
        }
    }

    /// Whether prior state survived loading.
    #[must_use]
    pub fn is_incremental(&self) -> bool {
        self.prior_record.is_some()
    }

    #[must_use]
    pub fn graph(&self) -> &ModuleDepGraph {
        &self.graph
    }

    /// Choose the first wave from the build record, changed external
    /// dependencies, and speculative cascading expansion.
    pub fn plan_first_wave(&mut self, mtimes: &[(InputPath, SystemTime)]) -> FirstWave {
        let mut scheduled: BTreeSet<InputPath> = self.always_compile.clone();
        let mut cascading: Vec<InputPath> = Vec::new();

        match &self.prior_record {
            None => {
                scheduled.extend(self.inputs.iter().cloned());
            }
            Some(record) => {
                for (input, mtime) in mtimes {
                    let status = record.status_of(input, *mtime);
                    tracing::debug!(input = %input, ?status, "classified");
                    if status != InputStatus::UpToDate {
                        scheduled.insert(input.clone());
                    }
                    if status == InputStatus::NeedsCascadingBuild {
                        cascading.push(input.clone());
                    }
                }

                let build_time = record.build_time.to_system_time();
                let externals: Vec<String> = self
                    .graph
                    .external_dependencies()
                    .into_iter()
                    .map(str::to_owned)
                    .collect();
                for path in externals {
                    if external_changed_since(&path, build_time) {
                        let dependents = self.graph.find_externally_dependent_untraced_inputs(&path);
                        tracing::debug!(external = %path, dependents = dependents.len(), "external dependency changed");
                        scheduled.extend(dependents);
                    }
                }

                // Anticipate the cascade: schedule the dependents of every
                // cascading rebuild now rather than discovering them one
                // wave later.
                for input in cascading {
                    scheduled.extend(self.graph.find_inputs_to_recompile_when_input_changes(&input));
                }
            }
        }

        let skipped: BTreeSet<InputPath> = self
            .inputs
            .iter()
            .filter(|input| !scheduled.contains(*input))
            .cloned()
            .collect();

        self.skipped = skipped.clone();
        self.incomplete_first_wave = scheduled.clone();
        self.second_wave.clear();
        self.completed.clear();
        if self.incomplete_first_wave.is_empty() {
            self.first_wave_drained.signal();
        }

        tracing::info!(
            to_compile = scheduled.len(),
            skipped = skipped.len(),
            incremental = self.is_incremental(),
            "planned first wave"
        );
        FirstWave {
            to_compile: scheduled.into_iter().collect(),
            skipped: skipped.into_iter().collect(),
        }
    }

    /// Fold a finished job's freshly emitted artifact back into the graph
    /// and promote any invalidated skipped inputs into the second wave.
    ///
    /// Returns the inputs promoted by this completion.
    pub fn job_finished(&mut self, input: &InputPath) -> Result<Vec<InputPath>, JobCompletionError> {
        assert!(
            !self.handling_completion.swap(true, Ordering::SeqCst),
            "job completion handled concurrently"
        );
        let result = self.handle_completion(input);
        self.handling_completion.store(false, Ordering::SeqCst);
        result
    }

    fn handle_completion(&mut self, input: &InputPath) -> Result<Vec<InputPath>, JobCompletionError> {
        let Some(source) = self.graph.source_for(input).cloned() else {
            return Err(JobCompletionError::UnknownInput {
                input: input.clone(),
            });
        };

        let file_graph = read_source_file_graph(std::path::Path::new(source.as_str())).map_err(|err| {
            JobCompletionError::MissingDependencyArtifact {
                input: input.clone(),
                source: source.clone(),
                message: err.to_string(),
            }
        })?;

        let integration = self.graph.integrate(&file_graph).map_err(|err| {
            JobCompletionError::MissingDependencyArtifact {
                input: input.clone(),
                source: source.clone(),
                message: err.to_string(),
            }
        })?;

        // Newly discovered externals may themselves be incremental-capable:
        // if the path reads back as a dependency artifact, fold it in too,
        // transitively. A path that is just a file stays a plain external.
        let mut all_invalidated = integration.invalidated;
        let mut pending_externals = integration.discovered_external_deps;
        while let Some(path) = pending_externals.pop() {
            let Ok(external_graph) = read_source_file_graph(std::path::Path::new(&path)) else {
                continue;
            };
            let external = self.graph.integrate(&external_graph).map_err(|err| {
                JobCompletionError::ExternalRecursionFailed {
                    path: path.clone(),
                    message: err.to_string(),
                }
            })?;
            tracing::debug!(external = %path, "integrated incremental external dependency");
            all_invalidated.extend(external.invalidated);
            pending_externals.extend(external.discovered_external_deps);
        }

        let invalidated = self
            .graph
            .find_inputs_to_recompile_when_nodes_change(&all_invalidated);

        let mut promoted = Vec::new();
        for candidate in invalidated {
            if self.skipped.remove(&candidate) {
                self.second_wave.insert(candidate.clone());
                promoted.push(candidate);
            }
        }

        self.completed.insert(input.clone());
        if self.incomplete_first_wave.remove(input) && self.incomplete_first_wave.is_empty() {
            self.first_wave_drained.signal();
        }

        tracing::debug!(input = %input, promoted = promoted.len(), "job finished");
        Ok(promoted)
    }

    /// Block until every first-wave input has completed.
    pub fn wait_for_first_wave(&self) {
        self.first_wave_drained.wait();
    }

    /// Drain the inputs discovered for the second wave, sorted.
    pub fn take_second_wave(&mut self) -> Vec<InputPath> {
        std::mem::take(&mut self.second_wave).into_iter().collect()
    }

    /// Persist the module graph and the build record for the next run.
    ///
    /// A failed graph write is not fatal: the record is flagged so the
    /// next build distrusts the graph file and falls back to a full
    /// rebuild instead of reading a stale or partial graph.
    pub fn write_priors(
        &mut self,
        mtimes: &[(InputPath, SystemTime)],
        build_time: SystemTime,
    ) -> Result<(), BuildRecordError> {
        let mut record = BuildRecord::new(build_time);
        for (input, mtime) in mtimes {
            let status = if self.completed.contains(input) || self.skipped.contains(input) {
                InputStatus::UpToDate
            } else {
                InputStatus::NeedsCascadingBuild
            };
            record.record_input(input, status, *mtime);
        }

        if let Err(err) = write_module_graph(&self.graph, &self.config.graph_path) {
            tracing::warn!(error = %err, "could not persist dependency graph");
            record.mark_graph_invalid();
        }
        record.save(&self.config.build_record_path)
    }
}

fn external_changed_since(path: &str, build_time: SystemTime) -> bool {
    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(mtime) => mtime >= build_time,
        // Unreadable external: assume changed rather than go stale.
        Err(_) => true,
    }
}
