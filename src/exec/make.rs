//! External make-tool executor.
//!
//! Renders the build description into the working directory and hands
//! the whole build to the configured make tool in one synchronous
//! invocation. Response files for oversized command lines are written
//! by the rendering step.

use super::BuildExecutor;
use super::log::BuildLog;
use crate::graph::BuildJob;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

pub const BUILD_DESCRIPTION_NAME: &str = "build.mk";

pub struct MakeExecutor {
    pub make_tool: PathBuf,
}

impl BuildExecutor for MakeExecutor {
    fn run(&self, graph: &BuildJob, work_dir: &Path, log: &Arc<BuildLog>) -> Result<bool> {
        let description = work_dir.join(BUILD_DESCRIPTION_NAME);
        graph.render_build_description(&description)?;

        log.append_command(&format!(
            "{} -f {} all",
            self.make_tool.display(),
            BUILD_DESCRIPTION_NAME
        ));
        let output = Command::new(&self.make_tool)
            .arg("-f")
            .arg(BUILD_DESCRIPTION_NAME)
            .arg("all")
            .current_dir(work_dir)
            .output()
            .with_context(|| format!("Failed to run make tool {}", self.make_tool.display()))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            log.append(line);
        }
        for line in String::from_utf8_lossy(&output.stderr).lines() {
            log.append(line);
        }
        if !output.status.success() {
            log.append(&format!("Make tool exited with {}", output.status));
        }
        Ok(output.status.success())
    }
}
