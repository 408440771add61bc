//! Build execution strategies.
//!
//! Two ways to run a [`BuildJob`](crate::graph::BuildJob): the internal
//! process pool and the external make tool. Which one runs is explicit
//! job configuration, not a code path.

mod log;
mod make;
mod pool;

pub use log::BuildLog;
pub use make::{BUILD_DESCRIPTION_NAME, MakeExecutor};
pub use pool::PoolExecutor;

use crate::graph::BuildJob;
use crate::job::{ExecutorKind, TestJob};
use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub trait BuildExecutor {
    /// Execute the whole graph. `Ok(false)` is a build failure (data for
    /// classification); `Err` is reserved for configuration problems.
    fn run(&self, graph: &BuildJob, work_dir: &Path, log: &Arc<BuildLog>) -> Result<bool>;
}

/// Build the executor the job file asked for.
pub fn from_job(job: &TestJob) -> Result<Box<dyn BuildExecutor>> {
    match job.executor {
        ExecutorKind::Pool => Ok(Box::new(PoolExecutor::new(
            job.slot_count,
            job.task_timeout_secs.map(Duration::from_secs),
        ))),
        ExecutorKind::Make => {
            let make_tool = job
                .make_tool
                .clone()
                .ok_or_else(|| anyhow::anyhow!("executor = \"make\" requires make_tool"))?;
            Ok(Box::new(MakeExecutor { make_tool }))
        }
    }
}
