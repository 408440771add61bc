//! # bspcheck - BSP Build-Validation Harness
//!
//! bspcheck proves that a board support package actually builds: for
//! every targeted device/sample combination it assembles a
//! compile/link/objcopy task graph, runs it with bounded concurrency,
//! and classifies the result from the artifacts the build left behind.
//!
//! ## Features
//!
//! - **Matrix validation**: every device × sample pair, regex-filtered
//! - **Bounded parallel builds**: one child process per core, or an
//!   external make tool over a generated build description
//! - **Artifact classification**: entry-point symbol in the map file and
//!   a minimum image size, not just a zero exit code
//! - **Register-offset checks**: injected static assertions cross-check
//!   headers against the register database
//!
//! ## Quick Start
//!
//! ```bash
//! bspcheck job.toml out/
//! ```
//!
//! ## Module Organization
//!
//! - [`job`] - Job descriptor parsing (`job.toml`)
//! - [`bsp`] - BSP manifest and register database
//! - [`graph`] - Build-task model and graph assembly
//! - [`exec`] - Execution strategies (process pool, make tool)
//! - [`validate`] - Per-pair validation jobs and classification
//! - [`batch`] - Device × sample orchestration
//! - [`report`] - Run reports and the console summary

/// Device × sample orchestration and run statistics.
pub mod batch;

/// BSP manifest, flag bundles, register database.
pub mod bsp;

/// Build execution strategies.
pub mod exec;

/// Build-task model and graph assembly.
pub mod graph;

/// Job descriptor parsing (`job.toml`).
pub mod job;

/// Run reports and the console summary table.
pub mod report;

/// Per-(device, sample) validation jobs.
pub mod validate;
