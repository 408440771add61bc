//! # bspcheck CLI Entry Point
//!
//! `bspcheck <job.toml> <output-dir>` runs the full validation matrix
//! described by the job file. Individual build failures are data in the
//! report; only configuration errors produce a nonzero exit.

use anyhow::Result;
use clap::Parser;
use colored::*;
use std::path::PathBuf;

use bspcheck::batch;
use bspcheck::job::TestJob;

#[derive(Parser)]
#[command(name = "bspcheck")]
#[command(about = "Build-validation harness for embedded BSPs", version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
struct Cli {
    /// Path to the job descriptor (TOML)
    job: PathBuf,

    /// Output directory for working trees, logs and the report
    output: PathBuf,

    /// Echo every build command as it is scheduled
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let job = TestJob::load(&cli.job)?;
    batch::run_batch(&job, &cli.output, cli.verbose)?;

    println!(
        "\n{} Report written to {}",
        "📄".cyan(),
        cli.output.join("TestReport.txt").display()
    );
    Ok(())
}
