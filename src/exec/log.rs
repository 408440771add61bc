//! Shared build log.
//!
//! One `build.log` per validation job. The pool executor has several
//! child processes writing at once, so every append goes through a
//! mutex; pool writers tag their lines with the originating slot index.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct BuildLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl BuildLog {
    pub fn create(path: PathBuf) -> Result<BuildLog> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create build log {}", path.display()))?;
        Ok(BuildLog {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line. Log writes never fail the build; a poisoned lock
    /// or write error is swallowed deliberately.
    pub fn append(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }

    /// Append a child-process output line, tagged with its slot.
    pub fn append_tagged(&self, slot: usize, line: &str) {
        self.append(&format!("[slot {}] {}", slot, line));
    }

    /// Record the command about to run.
    pub fn append_command(&self, cmd: &str) {
        self.append(&format!("> {}", cmd));
    }

    /// Scan the log for a substring. Used by lenient result
    /// classification.
    pub fn contains(&self, needle: &str) -> bool {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
        std::fs::read_to_string(&self.path)
            .map(|text| text.contains(needle))
            .unwrap_or(false)
    }
}
