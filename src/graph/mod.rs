//! Build graph assembly and rendering.
//!
//! A [`BuildJob`] is two ordered task lists behind an explicit [`Phase`]:
//! one compile task per recognized source, then the finalize chain (link,
//! binary conversion, optional CMSE veneer export). Ordering within a
//! phase is declaration order; the finalize phase never starts before the
//! compile phase completed successfully.

mod task;

pub use task::{
    ALL_INPUTS, BuildTask, FIRST_INPUT, MAX_COMMAND_LEN, MAX_INPUT_LIST_LEN, OUTPUT,
    normalize_path, quote_path, split_command,
};

use crate::bsp::ToolFlags;
use crate::job::{PolicyFlags, TestJob};
use anyhow::{Context, Result, bail};
use colored::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Execution phases of a build. Finalize tasks run strictly after all
/// compile tasks, one at a time, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Compile,
    Finalize,
}

/// Toolchain binaries used by the graph.
#[derive(Debug, Clone)]
pub struct Toolset {
    pub cc: PathBuf,
    pub cxx: PathBuf,
    pub objcopy: PathBuf,
}

impl Toolset {
    pub fn from_job(job: &TestJob) -> Toolset {
        Toolset {
            cc: job.tool_path("gcc"),
            cxx: job.tool_path("g++"),
            objcopy: job.tool_path("objcopy"),
        }
    }
}

#[derive(Debug)]
pub struct BuildJob {
    pub compile_tasks: Vec<BuildTask>,
    pub finalize_tasks: Vec<BuildTask>,
    pub warnings: Vec<String>,
    /// Linked image.
    pub elf: PathBuf,
    /// Linker map, read by classification.
    pub map: PathBuf,
    /// Raw binary image, read by classification.
    pub image: PathBuf,
}

impl BuildJob {
    pub fn tasks(&self, phase: Phase) -> &[BuildTask] {
        match phase {
            Phase::Compile => &self.compile_tasks,
            Phase::Finalize => &self.finalize_tasks,
        }
    }

    /// Assemble the graph for one build: `sources` resolved by the
    /// caller, flags read-only. Unrecognized extensions are warned about
    /// and dropped; output-name collisions are suffixed or fatal
    /// depending on policy.
    pub fn assemble(
        work_dir: &Path,
        output_stem: &str,
        sources: &[PathBuf],
        extensions: &[String],
        flags: &ToolFlags,
        tools: &Toolset,
        policy: &PolicyFlags,
        cmse: bool,
    ) -> Result<BuildJob> {
        let obj_dir = work_dir.join("obj");
        fs::create_dir_all(&obj_dir)
            .with_context(|| format!("Failed to create {}", obj_dir.display()))?;

        let mut common = String::new();
        for dir in &flags.include_dirs {
            common.push_str(&format!(" -I{}", quote_path(dir)));
        }
        for m in &flags.macros {
            common.push_str(&format!(" -D{}", m));
        }

        let mut warnings = Vec::new();
        let mut compile_tasks = Vec::new();
        let mut has_cpp = false;

        for src in sources {
            let ext = src
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default();

            if !extensions.iter().any(|e| *e == ext) {
                // Headers, prebuilt archives and docs ride along silently.
                if !["h", "hpp", "a", "txt", "ld"].contains(&ext.as_str()) {
                    let msg = format!("Ignoring {} (unrecognized extension)", src.display());
                    println!("   {} {}", "!".yellow(), msg);
                    warnings.push(msg);
                }
                continue;
            }

            let is_cpp = ["cpp", "cc", "cxx"].contains(&ext.as_str());
            let is_asm = ext == "s" || ext == "S";
            has_cpp |= is_cpp;

            let lang_flags = if is_cpp { &flags.cxxflags } else { &flags.cflags };
            let mut args = format!("-c {} -o {} -MD", FIRST_INPUT, OUTPUT);
            if ext == "S" {
                args.push_str(" -x assembler-with-cpp");
            }
            for f in lang_flags {
                args.push_str(&format!(" {}", f));
            }
            if !is_asm || ext == "S" {
                args.push_str(&common);
            }

            let stem = src
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let task = BuildTask::new(
                if is_cpp { tools.cxx.clone() } else { tools.cc.clone() },
                args,
                vec![src.clone()],
                obj_dir.join(format!("{}.o", stem)),
            )
            .ignoring_failure(policy.continue_past_compile_errors);
            compile_tasks.push(task);
        }

        if compile_tasks.is_empty() {
            bail!("No compilable sources for '{}'", output_stem);
        }

        let compile_tasks = apply_collision_policy(compile_tasks, policy.resolve_name_collisions)?;

        let elf = work_dir.join(format!("{}.elf", output_stem));
        let map = work_dir.join(format!("{}.map", output_stem));
        let image = work_dir.join(format!("{}.bin", output_stem));

        let mut link_inputs: Vec<PathBuf> =
            compile_tasks.iter().map(|t| t.output.clone()).collect();
        link_inputs.extend(flags.libraries.iter().cloned());

        let mut link_args = format!(
            "{} -o {} -T {} -Wl,-Map,{} -Wl,--gc-sections",
            ALL_INPUTS,
            OUTPUT,
            quote_path(&flags.linker_script),
            quote_path(&map),
        );
        for f in &flags.ldflags {
            link_args.push_str(&format!(" {}", f));
        }

        let linker = if has_cpp { tools.cxx.clone() } else { tools.cc.clone() };
        let mut finalize_tasks = vec![
            BuildTask::new(linker, link_args, link_inputs, elf.clone()),
            BuildTask::new(
                tools.objcopy.clone(),
                format!("-O binary {} {}", FIRST_INPUT, OUTPUT),
                vec![elf.clone()],
                image.clone(),
            ),
        ];

        if cmse {
            finalize_tasks.push(BuildTask::new(
                tools.objcopy.clone(),
                format!("--only-section=.gnu.sgstubs {} {}", FIRST_INPUT, OUTPUT),
                vec![elf.clone()],
                work_dir.join(format!("{}_cmse_implib.o", output_stem)),
            ));
        }

        Ok(BuildJob {
            compile_tasks,
            finalize_tasks,
            warnings,
            elf,
            map,
            image,
        })
    }

    /// Render the Makefile-style build description consumed by the
    /// external make tool. Response files for oversized command lines
    /// land next to the description.
    pub fn render_build_description(&self, path: &Path) -> Result<()> {
        let rsp_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut text = String::from("# Generated build description; do not edit.\n");

        let mut final_targets: Vec<String> = self
            .finalize_tasks
            .iter()
            .map(|t| normalize_path(&t.output))
            .collect();
        if final_targets.is_empty() {
            final_targets = self
                .compile_tasks
                .iter()
                .map(|t| normalize_path(&t.output))
                .collect();
        }
        text.push_str(&format!("all: {}\n\n.PHONY: all\n\n", final_targets.join(" ")));

        for task in self.compile_tasks.iter().chain(self.finalize_tasks.iter()) {
            let inputs: Vec<String> = task.inputs.iter().map(|p| normalize_path(p)).collect();
            let prefix = if task.ignore_failure { "-" } else { "" };
            text.push_str(&format!(
                "{}: {}\n\t{}{}\n\n",
                normalize_path(&task.output),
                inputs.join(" "),
                prefix,
                task.command_line(rsp_dir)?,
            ));
        }

        fs::write(path, text)
            .with_context(|| format!("Failed to write build description {}", path.display()))
    }
}

/// Group compile tasks by case-insensitive output basename. Two sources
/// like `a/foo.c` and `b/foo.c` would silently overwrite each other's
/// object file; either disambiguate every group member or abort.
fn apply_collision_policy(tasks: Vec<BuildTask>, resolve: bool) -> Result<Vec<BuildTask>> {
    let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (i, task) in tasks.iter().enumerate() {
        groups.entry(task.output_key()).or_default().push(i);
    }

    let colliding: Vec<(&String, &Vec<usize>)> =
        groups.iter().filter(|(_, v)| v.len() > 1).collect();
    if colliding.is_empty() {
        return Ok(tasks);
    }

    if !resolve {
        let mut lines = Vec::new();
        for (key, members) in &colliding {
            let sources: Vec<String> = members
                .iter()
                .flat_map(|&i| tasks[i].inputs.iter().map(|p| p.display().to_string()))
                .collect();
            lines.push(format!("{}: {}", key, sources.join(", ")));
        }
        bail!("Output name collision(s): {}", lines.join("; "));
    }

    let mut tasks = tasks;
    for (_, members) in &colliding {
        for (n, &i) in members.iter().enumerate() {
            tasks[i] = tasks[i].with_output_suffix(n);
        }
    }

    // All outputs must now be unique.
    let mut seen = BTreeMap::new();
    for task in &tasks {
        if let Some(prev) = seen.insert(task.output_key(), task.output.clone()) {
            bail!(
                "Collision resolution failed to disambiguate {} vs {}",
                prev.display(),
                task.output.display()
            );
        }
    }
    Ok(tasks)
}
