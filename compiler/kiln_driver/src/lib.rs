//! Incremental Build Scheduling
//!
//! The driver-side half of Kiln's incremental compilation: compares the
//! current inputs to the previous build's record, consults the persisted
//! module dependency graph, and schedules compilation in two waves.
//!
//! # Two Waves
//!
//! ```text
//! build record + mtimes ──▶ plan_first_wave() ──▶ compile jobs
//!                                                     │ job_finished()
//!                                     .kdeps ──▶ integrate ──▶ promote
//!                                                     │
//!                            first wave drains ──▶ second wave
//! ```
//!
//! The module graph itself lives in [`kiln_depgraph`]; this crate owns
//! the build record, the output-file map, and the scheduler.

pub mod build_record;
pub mod output_map;
pub mod scheduler;
pub mod tracing_setup;

pub use build_record::{BuildRecord, BuildRecordError, InputStatus};
pub use output_map::{FileType, OutputFileMap, OutputMapError};
pub use scheduler::{FirstWave, IncrementalScheduler, JobCompletionError, SchedulerConfig};
