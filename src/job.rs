//! Job descriptor parsing (`job.toml`).
//!
//! A job file describes one validation run: where the BSP and toolchain
//! live, which devices and samples to test, and the policy knobs that
//! change collision handling, cleanup and result classification.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug)]
pub struct TestJob {
    /// Root directory of the BSP under test (must contain `bsp.json`).
    pub bsp_dir: PathBuf,

    /// Directory holding the cross toolchain binaries.
    pub toolchain_dir: PathBuf,

    /// Binary name prefix, e.g. `arm-none-eabi-`.
    #[serde(default)]
    pub toolchain_prefix: String,

    /// Build execution strategy.
    #[serde(default)]
    pub executor: ExecutorKind,

    /// Path to the make tool; only required when `executor = "make"`.
    pub make_tool: Option<PathBuf>,

    /// Concurrency override for the pool executor. Default: processor count.
    pub slot_count: Option<usize>,

    /// Kill a child process that runs longer than this. Unset = no timeout.
    pub task_timeout_secs: Option<u64>,

    /// Only devices matching this regex are tested.
    pub device_filter: Option<String>,

    /// Devices matching this regex are dropped after the include filter.
    pub device_exclusion: Option<String>,

    #[serde(default)]
    pub policy: PolicyFlags,

    #[serde(default)]
    pub samples: Vec<SampleSpec>,

    /// Per-device configuration overrides, matched by regex in order.
    #[serde(default)]
    pub device_overrides: Vec<DeviceOverride>,

    /// Rules mapping documented register names to header field spellings.
    #[serde(default)]
    pub register_renames: Vec<RenameRule>,

    /// Register name patterns that are never offset-checked.
    #[serde(default)]
    pub non_validated_registers: Vec<String>,

    /// Macro name patterns stripped from every compile command.
    #[serde(default)]
    pub undefined_macros: Vec<String>,
}

/// Independent policy toggles of a single validation job. Constructed once
/// per run, read-only afterwards.
#[derive(Deserialize, Debug, Default, Clone, Copy)]
pub struct PolicyFlags {
    /// Keep the working directory even when the build passed.
    #[serde(default)]
    pub keep_dir_on_success: bool,

    /// Suffix colliding object names instead of failing the job.
    #[serde(default)]
    pub resolve_name_collisions: bool,

    /// Keep compiling after the first compile error.
    #[serde(default)]
    pub continue_past_compile_errors: bool,

    /// Treat "undefined reference" link failures as success.
    #[serde(default)]
    pub ignore_linker_errors: bool,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Internal bounded-concurrency process pool.
    #[default]
    Pool,
    /// External make tool driving the rendered build description.
    Make,
}

#[derive(Deserialize, Debug)]
pub struct SampleSpec {
    pub name: String,

    /// Narrows this sample to devices matching the regex.
    pub device_filter: Option<String>,

    /// Record `Skipped` instead of failing the run when the sample is
    /// absent from the BSP.
    #[serde(default)]
    pub skip_if_missing: bool,

    /// Inject register-offset assertions into the staged sources.
    #[serde(default)]
    pub validate_registers: bool,

    /// Extensions compiled as sources. Anything else (except h/a/txt)
    /// is warned about and dropped.
    #[serde(default = "default_source_extensions")]
    pub source_extensions: Vec<String>,

    /// Base settings for this sample, applied before device overrides.
    #[serde(default)]
    pub defaults: BTreeMap<String, String>,

    /// Per-device settings scoped to this sample, matched by regex.
    #[serde(default)]
    pub device_settings: Vec<DeviceOverride>,

    /// Final per-sample overrides; win over everything else.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug)]
pub struct DeviceOverride {
    pub device_regex: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RenameRule {
    pub find: String,
    pub replace: String,
}

fn default_source_extensions() -> Vec<String> {
    ["c", "cpp", "cc", "cxx", "s", "S"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl TestJob {
    pub fn load(path: &Path) -> Result<TestJob> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file {}", path.display()))?;
        let job: TestJob = toml::from_str(&text)
            .with_context(|| format!("Failed to parse job file {}", path.display()))?;
        if job.executor == ExecutorKind::Make && job.make_tool.is_none() {
            anyhow::bail!("executor = \"make\" requires make_tool to be set");
        }
        Ok(job)
    }

    /// Path of a toolchain binary, e.g. `tool_path("gcc")` with prefix
    /// `arm-none-eabi-` yields `<dir>/arm-none-eabi-gcc`.
    pub fn tool_path(&self, tool: &str) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{}{}.exe", self.toolchain_prefix, tool)
        } else {
            format!("{}{}", self.toolchain_prefix, tool)
        };
        self.toolchain_dir.join(name)
    }
}

/// Merge configuration layers key-by-key; later layers win.
pub fn merge_layers(layers: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Expand `$$KEY$$` references against the merged map. Expansion is
/// repeated so values may reference other expanded values; depth is
/// bounded to keep cyclic definitions from looping.
pub fn expand_value(cfg: &BTreeMap<String, String>, value: &str) -> String {
    let mut current = value.to_string();
    for _ in 0..10 {
        if !current.contains("$$") {
            break;
        }
        let mut next = current.clone();
        for (k, v) in cfg {
            let needle = format!("$${}$$", k);
            if next.contains(&needle) {
                next = next.replace(&needle, v);
            }
        }
        if next == current {
            break;
        }
        current = next;
    }
    current
}
