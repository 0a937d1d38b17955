//! Output-File Map
//!
//! Maps each input to the files the compiler produces for it. The
//! incremental engine reads only the dependency-artifact entries; the
//! rest ride along for the other driver subsystems.
//!
//! On disk this is JSON keyed by input path:
//!
//! ```json
//! {
//!   "main.kiln": { "object": "main.o", "deps": "main.kdeps" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kiln_depgraph::{InputPath, SourcePath};

/// The kinds of per-input output files the map can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Object,
    Deps,
    Diagnostics,
}

/// Input path → output paths by type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputFileMap {
    entries: BTreeMap<String, BTreeMap<FileType, String>>,
}

impl OutputFileMap {
    #[must_use]
    pub fn new() -> Self {
        OutputFileMap::default()
    }

    pub fn load(path: &Path) -> Result<Self, OutputMapError> {
        let text = fs::read_to_string(path).map_err(|err| OutputMapError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&text).map_err(|err| OutputMapError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }

    pub fn add_entry(&mut self, input: &InputPath, file_type: FileType, output: impl Into<String>) {
        self.entries
            .entry(input.as_str().to_owned())
            .or_default()
            .insert(file_type, output.into());
    }

    #[must_use]
    pub fn output_for(&self, input: &InputPath, file_type: FileType) -> Option<&str> {
        self.entries
            .get(input.as_str())
            .and_then(|outputs| outputs.get(&file_type))
            .map(String::as_str)
    }

    /// The dependency-artifact path for an input, if one is mapped.
    #[must_use]
    pub fn deps_path_for(&self, input: &InputPath) -> Option<SourcePath> {
        self.output_for(input, FileType::Deps).map(SourcePath::new)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Error loading the output-file map.
#[derive(Debug, Clone)]
pub enum OutputMapError {
    Io { path: PathBuf, message: String },
    Parse { path: PathBuf, message: String },
}

impl fmt::Display for OutputMapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputMapError::Io { path, message } => {
                write!(f, "failed to read '{}': {}", path.display(), message)
            }
            OutputMapError::Parse { path, message } => {
                write!(f, "malformed output-file map '{}': {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for OutputMapError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deps_lookup() {
        let mut map = OutputFileMap::new();
        let input = InputPath::from("main.kiln");
        map.add_entry(&input, FileType::Object, "main.o");
        map.add_entry(&input, FileType::Deps, "main.kdeps");

        assert_eq!(map.deps_path_for(&input), Some(SourcePath::from("main.kdeps")));
        assert_eq!(map.output_for(&input, FileType::Object), Some("main.o"));
        assert_eq!(map.deps_path_for(&InputPath::from("other.kiln")), None);
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output-map.json");
        fs::write(
            &path,
            r#"{ "main.kiln": { "object": "main.o", "deps": "main.kdeps" } }"#,
        )
        .unwrap();

        let map = OutputFileMap::load(&path).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.deps_path_for(&InputPath::from("main.kiln")),
            Some(SourcePath::from("main.kdeps"))
        );
    }

    #[test]
    fn test_malformed_map_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "[]").unwrap();
        assert!(matches!(
            OutputFileMap::load(&path),
            Err(OutputMapError::Parse { .. })
        ));
    }
}
