//! Records exchanged between the capture side and the worker.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One replayable round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct History {
    pub index: u64,
    pub args: Vec<String>,
    pub output: String,
    /// Upstream round-trip duration in nanoseconds.
    pub exec_time: u64,
}

/// One demo-capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Project {
    pub name: String,
    pub working_dir: PathBuf,
    #[serde(default)]
    pub desc: String,
}

impl Project {
    /// Directory that holds this project's artifacts.
    pub fn dir(&self) -> PathBuf {
        self.working_dir.join(&self.name)
    }

    pub fn error_file(&self) -> PathBuf {
        self.dir().join("error.txt")
    }
}

pub fn history_file_name(index: u64) -> String {
    format!("history-{index:03}.json")
}

pub fn project_dir(working_dir: &Path, name: &str) -> PathBuf {
    working_dir.join(name)
}
