//! Bounded-concurrency process pool.
//!
//! Compile tasks run on up to N child processes at once, N = processor
//! count unless overridden. The pool is an array of slots, each holding
//! at most one in-flight child; a slot is reused only after the exit
//! code of its previous occupant has been checked. On the first failure
//! no further tasks launch and every running child is drained before
//! returning, so nothing is left touching the working directory.
//! Finalize tasks run strictly sequentially afterwards.

use super::BuildExecutor;
use super::log::BuildLog;
use crate::graph::{BuildJob, BuildTask, Phase};
use anyhow::Result;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct PoolExecutor {
    pub slots: usize,
    pub task_timeout: Option<Duration>,
}

impl PoolExecutor {
    pub fn new(slots: Option<usize>, task_timeout: Option<Duration>) -> PoolExecutor {
        let slots = slots.unwrap_or_else(|| {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        });
        PoolExecutor {
            slots: slots.max(1),
            task_timeout,
        }
    }
}

struct RunningTask {
    child: Child,
    name: String,
    started: Instant,
    ignore_failure: bool,
    readers: Vec<JoinHandle<()>>,
}

/// Fixed-size pool of optional child handles. Owned by one executor
/// invocation; no state survives between runs.
struct SlotPool {
    slots: Vec<Option<RunningTask>>,
}

impl SlotPool {
    fn new(n: usize) -> SlotPool {
        SlotPool {
            slots: (0..n).map(|_| None).collect(),
        }
    }

    /// First slot that is empty or holds an exited child. Reaps the
    /// exited child before handing the slot out; a reaped nonzero exit
    /// sets `failed`. Returns None while every slot is busy.
    fn find_free(
        &mut self,
        log: &BuildLog,
        timeout: Option<Duration>,
        failed: &mut bool,
    ) -> Option<usize> {
        for idx in 0..self.slots.len() {
            let exited = match self.slots[idx].as_mut() {
                None => return Some(idx),
                Some(rt) => {
                    if let Some(limit) = timeout
                        && rt.started.elapsed() > limit
                    {
                        log.append(&format!(
                            "Task '{}' exceeded the {}s timeout, killing it",
                            rt.name,
                            limit.as_secs()
                        ));
                        let _ = rt.child.kill();
                    }
                    match rt.child.try_wait() {
                        Ok(Some(status)) => Some(Ok(status)),
                        Ok(None) => None,
                        Err(e) => Some(Err(e)),
                    }
                }
            };

            if let Some(result) = exited {
                let rt = self.slots[idx].take().expect("occupied slot");
                match result {
                    Ok(status) => {
                        if !reap(rt, status, log) {
                            *failed = true;
                        }
                    }
                    Err(e) => {
                        log.append(&format!("Failed to poll a child process: {}", e));
                        *failed = true;
                    }
                }
                return Some(idx);
            }
        }
        None
    }

    /// Block until every slot is empty. Returns false if any drained
    /// child exited nonzero.
    fn drain(&mut self, log: &BuildLog, timeout: Option<Duration>) -> bool {
        let mut all_ok = true;
        loop {
            let mut any_running = false;
            let mut failed = false;
            for idx in 0..self.slots.len() {
                if self.slots[idx].is_none() {
                    continue;
                }
                if !self.poll_slot(idx, log, timeout, &mut failed) {
                    any_running = true;
                }
            }
            if failed {
                all_ok = false;
            }
            if !any_running {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        all_ok
    }

    /// Poll a single occupied slot; true if it was reaped.
    fn poll_slot(
        &mut self,
        idx: usize,
        log: &BuildLog,
        timeout: Option<Duration>,
        failed: &mut bool,
    ) -> bool {
        let exited = match self.slots[idx].as_mut() {
            None => return true,
            Some(rt) => {
                if let Some(limit) = timeout
                    && rt.started.elapsed() > limit
                {
                    log.append(&format!(
                        "Task '{}' exceeded the {}s timeout, killing it",
                        rt.name,
                        limit.as_secs()
                    ));
                    let _ = rt.child.kill();
                }
                match rt.child.try_wait() {
                    Ok(Some(status)) => Some(Ok(status)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                }
            }
        };
        if let Some(result) = exited {
            let rt = self.slots[idx].take().expect("occupied slot");
            match result {
                Ok(status) => {
                    if !reap(rt, status, log) {
                        *failed = true;
                    }
                }
                Err(e) => {
                    log.append(&format!("Failed to poll a child process: {}", e));
                    *failed = true;
                }
            }
            return true;
        }
        false
    }
}

/// Join the output readers and record the exit. True when the task
/// counts as successful.
fn reap(rt: RunningTask, status: ExitStatus, log: &BuildLog) -> bool {
    for reader in rt.readers {
        let _ = reader.join();
    }
    if status.success() {
        true
    } else {
        log.append(&format!("Task '{}' failed: {}", rt.name, status));
        rt.ignore_failure
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    slot: usize,
    log: Arc<BuildLog>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => log.append_tagged(slot, &line),
                Err(_) => break,
            }
        }
    })
}

fn spawn_task(
    task: &BuildTask,
    work_dir: &Path,
    slot: usize,
    log: &Arc<BuildLog>,
) -> std::io::Result<RunningTask> {
    log.append_command(&task.rendered_command());
    let mut child = Command::new(&task.executable)
        .args(task.argv())
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, slot, Arc::clone(log)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, slot, Arc::clone(log)));
    }

    Ok(RunningTask {
        child,
        name: task
            .output
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        started: Instant::now(),
        ignore_failure: task.ignore_failure,
        readers,
    })
}

/// Run one task synchronously to completion, output captured into the
/// log. Used for the finalize phase.
pub(super) fn run_sync(task: &BuildTask, work_dir: &Path, log: &BuildLog) -> bool {
    log.append_command(&task.rendered_command());
    let output = Command::new(&task.executable)
        .args(task.argv())
        .current_dir(work_dir)
        .output();
    match output {
        Ok(out) => {
            for line in String::from_utf8_lossy(&out.stdout).lines() {
                log.append(line);
            }
            for line in String::from_utf8_lossy(&out.stderr).lines() {
                log.append(line);
            }
            if !out.status.success() {
                log.append(&format!(
                    "Task '{}' failed: {}",
                    task.output.display(),
                    out.status
                ));
            }
            out.status.success() || task.ignore_failure
        }
        Err(e) => {
            log.append(&format!(
                "Failed to start {}: {}",
                task.executable.display(),
                e
            ));
            task.ignore_failure
        }
    }
}

impl BuildExecutor for PoolExecutor {
    fn run(&self, graph: &BuildJob, work_dir: &Path, log: &Arc<BuildLog>) -> Result<bool> {
        let mut pool = SlotPool::new(self.slots);
        let mut failed = false;

        for task in graph.tasks(Phase::Compile) {
            let idx = loop {
                if let Some(i) = pool.find_free(log, self.task_timeout, &mut failed) {
                    break i;
                }
                thread::sleep(POLL_INTERVAL);
            };
            if failed {
                break;
            }
            match spawn_task(task, work_dir, idx, log) {
                Ok(rt) => pool.slots[idx] = Some(rt),
                Err(e) => {
                    log.append(&format!(
                        "Failed to start {}: {}",
                        task.executable.display(),
                        e
                    ));
                    if !task.ignore_failure {
                        failed = true;
                        break;
                    }
                }
            }
        }

        // Always wait for everything still running, failure or not.
        let drained_ok = pool.drain(log, self.task_timeout);
        if failed || !drained_ok {
            return Ok(false);
        }

        for task in graph.tasks(Phase::Finalize) {
            if !run_sync(task, work_dir, log) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::graph::BuildTask;
    use std::path::PathBuf;

    fn sh_task(script: &str, output: PathBuf) -> BuildTask {
        BuildTask::new("/bin/sh", format!("-c \"{}\"", script), vec![], output)
    }

    fn graph_of(compile: Vec<BuildTask>, finalize: Vec<BuildTask>, dir: &Path) -> BuildJob {
        BuildJob {
            compile_tasks: compile,
            finalize_tasks: finalize,
            warnings: vec![],
            elf: dir.join("out.elf"),
            map: dir.join("out.map"),
            image: dir.join("out.bin"),
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bspcheck_pool_tests").join(name);
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_single_slot_failure_never_launches_next_task() {
        let dir = test_dir("fail_stops");
        let log = Arc::new(BuildLog::create(dir.join("build.log")).unwrap());

        let t1 = sh_task("sleep 0.2 && touch first.marker", dir.join("first.o"));
        let t2 = sh_task("exit 3", dir.join("second.o"));
        let t3 = sh_task("touch third.marker", dir.join("third.o"));
        let graph = graph_of(vec![t1, t2, t3], vec![], &dir);

        let pool = PoolExecutor {
            slots: 1,
            task_timeout: None,
        };
        let ok = pool.run(&graph, &dir, &log).unwrap();

        assert!(!ok);
        // The first task was waited for, not orphaned.
        assert!(dir.join("first.marker").exists());
        // The third task never launched.
        assert!(!dir.join("third.marker").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_finalize_runs_after_compiles_and_aborts_on_failure() {
        let dir = test_dir("finalize_order");
        let log = Arc::new(BuildLog::create(dir.join("build.log")).unwrap());

        let compile = vec![
            sh_task("touch a.o.marker", dir.join("a.o")),
            sh_task("touch b.o.marker", dir.join("b.o")),
        ];
        let finalize = vec![
            // Proves both compiles finished before the link starts.
            sh_task(
                "test -f a.o.marker && test -f b.o.marker && touch linked.marker",
                dir.join("out.elf"),
            ),
            sh_task("exit 1", dir.join("out.bin")),
            sh_task("touch after_failure.marker", dir.join("out.hex")),
        ];
        let graph = graph_of(compile, finalize, &dir);

        let pool = PoolExecutor {
            slots: 4,
            task_timeout: None,
        };
        let ok = pool.run(&graph, &dir, &log).unwrap();

        assert!(!ok);
        assert!(dir.join("linked.marker").exists());
        // Nothing runs past the first finalize failure.
        assert!(!dir.join("after_failure.marker").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_child_output_is_slot_tagged() {
        let dir = test_dir("tagged");
        let log = Arc::new(BuildLog::create(dir.join("build.log")).unwrap());

        let graph = graph_of(
            vec![sh_task("echo hello from child", dir.join("a.o"))],
            vec![],
            &dir,
        );
        let pool = PoolExecutor {
            slots: 2,
            task_timeout: None,
        };
        assert!(pool.run(&graph, &dir, &log).unwrap());

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(
            text.contains("[slot 0] hello from child"),
            "log was: {}",
            text
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_ignored_failure_does_not_stop_the_build() {
        let dir = test_dir("ignored");
        let log = Arc::new(BuildLog::create(dir.join("build.log")).unwrap());

        let failing = sh_task("exit 1", dir.join("bad.o")).ignoring_failure(true);
        let after = sh_task("touch after.marker", dir.join("after.o"));
        let graph = graph_of(vec![failing, after], vec![], &dir);

        let pool = PoolExecutor {
            slots: 1,
            task_timeout: None,
        };
        assert!(pool.run(&graph, &dir, &log).unwrap());
        assert!(dir.join("after.marker").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_timeout_kills_hung_task() {
        let dir = test_dir("timeout");
        let log = Arc::new(BuildLog::create(dir.join("build.log")).unwrap());

        let graph = graph_of(vec![sh_task("sleep 30", dir.join("hung.o"))], vec![], &dir);
        let pool = PoolExecutor {
            slots: 1,
            task_timeout: Some(Duration::from_millis(200)),
        };

        let started = Instant::now();
        let ok = pool.run(&graph, &dir, &log).unwrap();
        assert!(!ok);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(log.contains("timeout"));
        std::fs::remove_dir_all(&dir).ok();
    }
}
