//! Batch orchestration over the device × sample matrix.
//!
//! Strictly sequential: one (device, sample) pair at a time, parallelism
//! lives inside the pool executor. Build failures are recorded and the
//! run continues; configuration mistakes abort the whole batch.

use crate::bsp::{BspManifest, DeviceRecord, RegisterDatabase};
use crate::exec;
use crate::graph::Toolset;
use crate::job::TestJob;
use crate::report::{self, SampleOutcome};
use crate::validate::{self, TestResult, ValidationContext, registers};
use anyhow::{Context, Result, bail};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Pass/fail accumulator for a whole run. Skips count in neither.
#[derive(Debug, Default, Clone, Copy)]
pub struct TestStatistics {
    pub passed: usize,
    pub failed: usize,
}

pub fn run_batch(job: &TestJob, out_dir: &Path, verbose: bool) -> Result<TestStatistics> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;

    let bsp = BspManifest::load(&job.bsp_dir)?;
    println!(
        "{} BSP: {} ({} devices, {} samples)",
        "🔍".blue(),
        bsp.name.bold(),
        bsp.devices.len(),
        job.samples.len()
    );

    // All filters compile up front; a bad regex must abort before any
    // build runs.
    let devices = filter_devices(job, &bsp)?;
    if devices.is_empty() {
        bail!("No devices left after applying the device filters");
    }

    let register_db = load_register_db(job, &bsp)?;
    let renames = registers::RenameRules::compile(&job.register_renames)?;
    let blocklist = registers::Blocklist::compile(&job.non_validated_registers)?;
    let dropped_macros = compile_patterns(&job.undefined_macros, "undefined-macro")?;

    let executor = exec::from_job(job)?;
    let tools = Toolset::from_job(job);
    let ctx = ValidationContext {
        job,
        bsp: &bsp,
        registers: register_db.as_ref(),
        renames: &renames,
        blocklist: &blocklist,
        dropped_macros: &dropped_macros,
        tools: &tools,
        executor: executor.as_ref(),
        out_dir,
        verbose,
    };

    let mut stats = TestStatistics::default();
    let mut outcomes = Vec::new();

    for sample in &job.samples {
        let narrowed = narrow_devices(&devices, sample.device_filter.as_deref())
            .with_context(|| format!("Sample '{}'", sample.name))?;

        println!("\n{} Sample: {}", "🧪".magenta(), sample.name.bold());
        let pb = ProgressBar::new(narrowed.len() as u64);
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                .expect("valid template")
                .progress_chars("#>-"),
        );

        let mut outcome = SampleOutcome::new(&sample.name);
        let mut sample_deps: BTreeSet<PathBuf> = BTreeSet::new();

        for device in &narrowed {
            pb.set_message(device.id.clone());
            match validate::run_one(&ctx, device, sample)? {
                TestResult::Succeeded { dependencies } => {
                    pb.println(format!("   {} {}", "✓".green(), device.id));
                    stats.passed += 1;
                    outcome.passed.push(device.id.clone());
                    sample_deps.extend(dependencies);
                }
                TestResult::Failed { log } => {
                    pb.println(format!(
                        "   {} {} (log: {})",
                        "x".red(),
                        device.id,
                        log.display()
                    ));
                    stats.failed += 1;
                    outcome.failed.push(device.id.clone());
                }
                TestResult::Skipped => {
                    pb.println(format!("   {} {} skipped", "!".yellow(), device.id));
                    outcome.skipped.push(device.id.clone());
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        if !outcome.ran_anywhere() {
            bail!(
                "Sample '{}' did not build for any device; check the job file filters",
                sample.name
            );
        }

        write_sample_deps(out_dir, &sample.name, &sample_deps)?;
        outcomes.push(outcome);
    }

    report::write_report(&out_dir.join("TestReport.txt"), &outcomes)?;
    println!();
    report::print_summary(&outcomes);
    println!(
        "{} {} passed, {} failed",
        if stats.failed == 0 { "✓".green() } else { "x".red() },
        stats.passed,
        stats.failed
    );

    Ok(stats)
}

fn filter_devices<'a>(job: &TestJob, bsp: &'a BspManifest) -> Result<Vec<&'a DeviceRecord>> {
    let include = job
        .device_filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("Invalid device_filter regex")?;
    let exclude = job
        .device_exclusion
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("Invalid device_exclusion regex")?;

    Ok(bsp
        .devices
        .iter()
        .filter(|d| include.as_ref().is_none_or(|re| re.is_match(&d.id)))
        .filter(|d| !exclude.as_ref().is_some_and(|re| re.is_match(&d.id)))
        .collect())
}

fn narrow_devices<'a>(
    devices: &[&'a DeviceRecord],
    filter: Option<&str>,
) -> Result<Vec<&'a DeviceRecord>> {
    match filter {
        None => Ok(devices.to_vec()),
        Some(pattern) => {
            let re = Regex::new(pattern)
                .with_context(|| format!("Invalid device regex '{}'", pattern))?;
            Ok(devices
                .iter()
                .copied()
                .filter(|d| re.is_match(&d.id))
                .collect())
        }
    }
}

fn load_register_db(job: &TestJob, bsp: &BspManifest) -> Result<Option<RegisterDatabase>> {
    if !job.samples.iter().any(|s| s.validate_registers) {
        return Ok(None);
    }
    match &bsp.register_db {
        Some(rel) => Ok(Some(RegisterDatabase::load(&job.bsp_dir.join(rel))?)),
        None => {
            println!(
                "   {} Register validation requested but the BSP has no register database",
                "!".yellow()
            );
            Ok(None)
        }
    }
}

fn compile_patterns(patterns: &[String], what: &str) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("Invalid {} regex '{}'", what, p)))
        .collect()
}

/// Minimized per-sample dependency list for downstream packaging.
fn write_sample_deps(out_dir: &Path, sample: &str, deps: &BTreeSet<PathBuf>) -> Result<()> {
    let mut text = String::new();
    for dep in deps {
        text.push_str(&format!("{}\n", dep.display()));
    }
    let path = out_dir.join(format!("{}.deps.txt", sample));
    fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))
}
