//! Per-(device, sample) validation job.
//!
//! Each job owns a fresh working directory, stages the sample sources
//! into it, assembles and runs the build graph, classifies the result
//! from the artifacts, and on success extracts the dependency set for
//! downstream packaging. Build failures are data, never errors; only
//! configuration mistakes propagate.

pub mod classify;
pub mod deps;
pub mod registers;

use crate::bsp::{BspManifest, DeviceRecord, RegisterDatabase};
use crate::exec::{BuildExecutor, BuildLog};
use crate::graph::{BuildJob, Toolset};
use crate::job::{SampleSpec, TestJob, expand_value, merge_layers};
use anyhow::{Context, Result, bail};
use colored::*;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

use registers::{Blocklist, RenameRules};

/// Outcome of one (device, sample) evaluation. Never retried.
#[derive(Debug)]
pub enum TestResult {
    Succeeded { dependencies: Vec<PathBuf> },
    Failed { log: PathBuf },
    Skipped,
}

/// Everything shared across the jobs of one batch run.
pub struct ValidationContext<'a> {
    pub job: &'a TestJob,
    pub bsp: &'a BspManifest,
    pub registers: Option<&'a RegisterDatabase>,
    pub renames: &'a RenameRules,
    pub blocklist: &'a Blocklist,
    pub dropped_macros: &'a [Regex],
    pub tools: &'a Toolset,
    pub executor: &'a dyn BuildExecutor,
    pub out_dir: &'a Path,
    pub verbose: bool,
}

/// Optional descriptor inside a sample directory.
#[derive(Deserialize, Debug, Default)]
struct SampleFile {
    #[serde(default)]
    settings: BTreeMap<String, String>,
}

pub fn run_one(
    ctx: &ValidationContext,
    device: &DeviceRecord,
    sample: &SampleSpec,
) -> Result<TestResult> {
    let sample_dir = ctx.job.bsp_dir.join("samples").join(&sample.name);
    if !sample_dir.is_dir() {
        if sample.skip_if_missing {
            return Ok(TestResult::Skipped);
        }
        bail!(
            "Sample '{}' not found at {}",
            sample.name,
            sample_dir.display()
        );
    }

    let work_dir = ctx.out_dir.join(&sample.name).join(&device.id);
    recreate_dir(&work_dir)?;

    let sample_file = load_sample_file(&sample_dir)?;
    let cfg = merged_settings(ctx.job, ctx.bsp, device, sample, &sample_file.settings)?;

    let staged = stage_sample_sources(&sample_dir, &work_dir, sample, &cfg)?;

    if sample.validate_registers
        && let Some(db) = ctx.registers
    {
        let code = registers::generate_assertions(db, ctx.renames, ctx.blocklist);
        match staged.iter().find(|p| p.extension().is_some_and(|e| e == "c")) {
            Some(first_c) => registers::inject_into(first_c, &code)?,
            None => println!(
                "   {} No C source in '{}' to carry register checks",
                "!".yellow(),
                sample.name
            ),
        }
    }

    let flags = device.tool_flags(&ctx.job.bsp_dir, &cfg, ctx.dropped_macros);
    let mut sources: Vec<PathBuf> = device
        .sources
        .iter()
        .map(|s| ctx.job.bsp_dir.join(expand_value(&cfg, s)))
        .collect();
    sources.extend(staged.iter().cloned());

    let log = Arc::new(BuildLog::create(work_dir.join("build.log"))?);
    let log_path = log.path().to_path_buf();

    let graph = match BuildJob::assemble(
        &work_dir,
        &sample.name,
        &sources,
        &sample.source_extensions,
        &flags,
        ctx.tools,
        &ctx.job.policy,
        device.cmse,
    ) {
        Ok(graph) => graph,
        Err(e) => {
            // Graph-level problems (name collisions, empty source set)
            // fail this pair; the batch moves on.
            log.append(&format!("{:#}", e));
            return Ok(TestResult::Failed { log: log_path });
        }
    };

    write_compile_commands(&work_dir, &graph)?;
    if ctx.verbose {
        for task in graph.compile_tasks.iter().chain(graph.finalize_tasks.iter()) {
            println!("   {}", task.rendered_command().dimmed());
        }
    }

    let exit_ok = ctx.executor.run(&graph, &work_dir, &log)?;
    let verdict = classify::classify(
        exit_ok,
        &graph.map,
        &graph.image,
        &log,
        ctx.job.policy.ignore_linker_errors,
    );

    match verdict {
        classify::Classification::Passed => {
            let dependencies =
                deps::collect_dependencies(&work_dir, &sources, &flags.aux_linker_scripts)?;
            if !ctx.job.policy.keep_dir_on_success {
                fs::remove_dir_all(&work_dir).ok();
            }
            Ok(TestResult::Succeeded { dependencies })
        }
        classify::Classification::Failed(reason) => {
            log.append(&format!("Classification: {}", reason));
            Ok(TestResult::Failed { log: log_path })
        }
    }
}

const RECREATE_ATTEMPTS: usize = 5;
const RECREATE_BACKOFF: Duration = Duration::from_millis(100);

/// Delete-and-create with bounded retries. Virus scanners and indexers
/// hold transient locks on freshly written build trees; exhausting the
/// retries is fatal.
pub fn recreate_dir(dir: &Path) -> Result<()> {
    let mut last_err = None;
    for _ in 0..RECREATE_ATTEMPTS {
        let result = if dir.exists() {
            fs::remove_dir_all(dir).and_then(|_| fs::create_dir_all(dir))
        } else {
            fs::create_dir_all(dir)
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                thread::sleep(RECREATE_BACKOFF);
            }
        }
    }
    Err(last_err.expect("at least one attempt")).with_context(|| {
        format!(
            "Failed to recreate working directory {} after {} attempts",
            dir.display(),
            RECREATE_ATTEMPTS
        )
    })
}

fn load_sample_file(sample_dir: &Path) -> Result<SampleFile> {
    let path = sample_dir.join("sample.json");
    if !path.exists() {
        return Ok(SampleFile::default());
    }
    let text = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
}

fn builtin_defaults() -> BTreeMap<String, String> {
    let mut cfg = BTreeMap::new();
    cfg.insert(
        "CFLAGS".to_string(),
        "-O1 -g -Wall -ffunction-sections -fdata-sections".to_string(),
    );
    cfg.insert(
        "CXXFLAGS".to_string(),
        "-O1 -g -Wall -ffunction-sections -fdata-sections -fno-exceptions -fno-rtti".to_string(),
    );
    cfg.insert("LDFLAGS".to_string(), "--specs=nano.specs".to_string());
    cfg
}

/// Merge the configuration layers in fixed precedence order, later
/// layers winning key-by-key: built-in defaults, family defaults,
/// device defaults, sample defaults (sample file, then job sample
/// block), job per-device overrides, job per-sample overrides.
pub fn merged_settings(
    job: &TestJob,
    bsp: &BspManifest,
    device: &DeviceRecord,
    sample: &SampleSpec,
    sample_file_settings: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let builtin = builtin_defaults();
    let empty = BTreeMap::new();
    let family = bsp.family_settings(&device.family).unwrap_or(&empty);

    let mut layers: Vec<&BTreeMap<String, String>> = vec![
        &builtin,
        family,
        &device.settings,
        sample_file_settings,
        &sample.defaults,
    ];

    // Job per-device overrides, then the sample-scoped ones on top.
    for over in &job.device_overrides {
        let re = Regex::new(&over.device_regex)
            .with_context(|| format!("Invalid device override regex '{}'", over.device_regex))?;
        if re.is_match(&device.id) {
            layers.push(&over.settings);
        }
    }
    for over in &sample.device_settings {
        let re = Regex::new(&over.device_regex).with_context(|| {
            format!(
                "Invalid device regex '{}' in sample '{}'",
                over.device_regex, sample.name
            )
        })?;
        if re.is_match(&device.id) {
            layers.push(&over.settings);
        }
    }
    layers.push(&sample.settings);

    Ok(merge_layers(&layers))
}

/// Copy the sample tree into the working directory, expanding `$$KEY$$`
/// placeholders in text files. Returns the staged compile sources in a
/// deterministic order.
fn stage_sample_sources(
    sample_dir: &Path,
    work_dir: &Path,
    sample: &SampleSpec,
    cfg: &BTreeMap<String, String>,
) -> Result<Vec<PathBuf>> {
    const TEXT_EXTENSIONS: &[&str] = &[
        "c", "cpp", "cc", "cxx", "h", "hpp", "s", "S", "ld", "txt",
    ];

    let mut staged_sources = Vec::new();
    for entry in WalkDir::new(sample_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(sample_dir)
            .expect("entry under sample dir");
        if rel == Path::new("sample.json") {
            continue;
        }
        let dest = work_dir.join(rel);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let ext = entry
            .path()
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            let content = fs::read_to_string(entry.path())
                .with_context(|| format!("Failed to read {}", entry.path().display()))?;
            fs::write(&dest, expand_value(cfg, &content))
                .with_context(|| format!("Failed to stage {}", dest.display()))?;
        } else {
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("Failed to stage {}", dest.display()))?;
        }

        if sample.source_extensions.iter().any(|e| *e == ext) {
            staged_sources.push(dest);
        }
    }
    staged_sources.sort();
    Ok(staged_sources)
}

/// IDE integration artifact, one entry per compile task.
fn write_compile_commands(work_dir: &Path, graph: &BuildJob) -> Result<()> {
    let entries: Vec<serde_json::Value> = graph
        .compile_tasks
        .iter()
        .map(|t| {
            json!({
                "directory": work_dir.to_string_lossy(),
                "command": t.rendered_command(),
                "file": t.inputs.first().map(|p| p.to_string_lossy().to_string()).unwrap_or_default(),
            })
        })
        .collect();
    let text = serde_json::to_string_pretty(&entries)?;
    fs::write(work_dir.join("compile_commands.json"), text)
        .context("Failed to write compile_commands.json")
}
