//! Build Record
//!
//! The JSON sidecar comparing one build to the next: per-input status and
//! modification time, the time of the previous successful build, and a
//! validity flag for the persisted module graph. The scheduler classifies
//! inputs against this record to pick the first wave.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use kiln_depgraph::InputPath;

/// How an input stands relative to the previous build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputStatus {
    /// Unchanged since the recorded build; may be skipped.
    UpToDate,
    /// Not present in the previous build.
    NewlyAdded,
    /// Must rebuild, and its dependents are suspect too.
    NeedsCascadingBuild,
    /// Must rebuild, but the change is file-private.
    NeedsNonCascadingBuild,
}

/// Seconds/nanos since the epoch; `SystemTime` has no serde form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    secs: u64,
    nanos: u32,
}

impl Timestamp {
    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Timestamp {
            secs: since_epoch.as_secs(),
            nanos: since_epoch.subsec_nanos(),
        }
    }

    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        UNIX_EPOCH + Duration::new(self.secs, self.nanos)
    }
}

/// Status plus modification time for one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputInfo {
    pub status: InputStatus,
    pub mtime: Timestamp,
}

/// The persisted record of the previous build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    /// When the previous build ran.
    pub build_time: Timestamp,
    /// False when the module-graph write failed; the next build must not
    /// trust the graph file.
    pub graph_is_valid: bool,
    /// Per-input records, keyed by input path.
    pub inputs: BTreeMap<String, InputInfo>,
}

impl BuildRecord {
    #[must_use]
    pub fn new(build_time: SystemTime) -> Self {
        BuildRecord {
            build_time: Timestamp::from_system_time(build_time),
            graph_is_valid: true,
            inputs: BTreeMap::new(),
        }
    }

    pub fn record_input(&mut self, input: &InputPath, status: InputStatus, mtime: SystemTime) {
        self.inputs.insert(
            input.as_str().to_owned(),
            InputInfo {
                status,
                mtime: Timestamp::from_system_time(mtime),
            },
        );
    }

    /// Classify an input for the next build.
    ///
    /// An input the record has never seen is newly added. One the
    /// previous build left unfinished keeps its needs-build status. An
    /// up-to-date input whose modification time moved, or is not earlier
    /// than the recorded build time, needs a cascading build.
    #[must_use]
    pub fn status_of(&self, input: &InputPath, current_mtime: SystemTime) -> InputStatus {
        let Some(info) = self.inputs.get(input.as_str()) else {
            return InputStatus::NewlyAdded;
        };
        if info.status != InputStatus::UpToDate {
            return info.status;
        }
        let changed = Timestamp::from_system_time(current_mtime) != info.mtime
            || current_mtime >= self.build_time.to_system_time();
        if changed {
            InputStatus::NeedsCascadingBuild
        } else {
            InputStatus::UpToDate
        }
    }

    /// Flag the persisted graph as untrustworthy for the next build.
    pub fn mark_graph_invalid(&mut self) {
        self.graph_is_valid = false;
    }

    pub fn load(path: &Path) -> Result<Self, BuildRecordError> {
        let text = fs::read_to_string(path).map_err(|err| BuildRecordError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|err| BuildRecordError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), BuildRecordError> {
        let text = serde_json::to_string_pretty(self).map_err(|err| BuildRecordError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        fs::write(path, text).map_err(|err| BuildRecordError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}

/// Error loading or saving a build record.
#[derive(Debug, Clone)]
pub enum BuildRecordError {
    Io { path: PathBuf, message: String },
    Parse { path: PathBuf, message: String },
}

impl fmt::Display for BuildRecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildRecordError::Io { path, message } => {
                write!(f, "failed to read '{}': {}", path.display(), message)
            }
            BuildRecordError::Parse { path, message } => {
                write!(f, "malformed build record '{}': {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for BuildRecordError {}
