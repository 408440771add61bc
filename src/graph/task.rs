//! Single external-process invocation with a templated argument string.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Placeholder expanded to the full ordered input list.
pub const ALL_INPUTS: &str = "$<ALL_INPUTS>";
/// Placeholder expanded to the first input only.
pub const FIRST_INPUT: &str = "$<FIRST_INPUT>";
/// Placeholder expanded to the primary output.
pub const OUTPUT: &str = "$<OUTPUT>";

/// Above this combined input-list length the inputs move to a response
/// file. Dodges OS/toolchain command-line limits on large projects.
pub const MAX_INPUT_LIST_LEN: usize = 5000;
/// Above this full-command length the arguments after the first input
/// move to a response file.
pub const MAX_COMMAND_LEN: usize = 7000;

/// One external tool invocation. Immutable; collision disambiguation
/// produces a new value via [`BuildTask::with_output_suffix`].
#[derive(Debug, Clone)]
pub struct BuildTask {
    pub executable: PathBuf,
    /// Argument template referencing `$<ALL_INPUTS>`, `$<FIRST_INPUT>`
    /// and `$<OUTPUT>`.
    pub arguments: String,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    /// Rendered with a `-` rule prefix; the pool executor treats a
    /// nonzero exit as non-fatal.
    pub ignore_failure: bool,
}

impl BuildTask {
    pub fn new(
        executable: impl Into<PathBuf>,
        arguments: impl Into<String>,
        inputs: Vec<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> BuildTask {
        BuildTask {
            executable: executable.into(),
            arguments: arguments.into(),
            inputs,
            output: output.into(),
            ignore_failure: false,
        }
    }

    pub fn ignoring_failure(mut self, ignore: bool) -> BuildTask {
        self.ignore_failure = ignore;
        self
    }

    /// Case-insensitive output basename, the collision-grouping key.
    pub fn output_key(&self) -> String {
        self.output
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default()
    }

    /// New task whose output stem carries a `_<idx>` suffix. Inputs and
    /// template are unchanged.
    pub fn with_output_suffix(&self, idx: usize) -> BuildTask {
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let ext = self
            .output
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let mut out = self.clone();
        out.output = self
            .output
            .with_file_name(format!("{}_{}{}", stem, idx, ext));
        out
    }

    fn joined_inputs(&self) -> String {
        self.inputs
            .iter()
            .map(|p| quote_path(p))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Expand every placeholder in place. Used for direct execution where
    /// no command-line length limit applies.
    pub fn rendered_command(&self) -> String {
        let args = self
            .arguments
            .replace(ALL_INPUTS, &self.joined_inputs())
            .replace(
                FIRST_INPUT,
                &self.inputs.first().map(|p| quote_path(p)).unwrap_or_default(),
            )
            .replace(OUTPUT, &quote_path(&self.output));
        format!("{} {}", quote_path(&self.executable), args)
    }

    /// Argument vector for direct execution (placeholders expanded,
    /// quotes honored).
    pub fn argv(&self) -> Vec<String> {
        let args = self
            .arguments
            .replace(ALL_INPUTS, &self.joined_inputs())
            .replace(
                FIRST_INPUT,
                &self.inputs.first().map(|p| quote_path(p)).unwrap_or_default(),
            )
            .replace(OUTPUT, &quote_path(&self.output));
        split_command(&args)
    }

    /// Render the command line for the external build tool, falling back
    /// to a response file when the inputs or the whole command outgrow
    /// the length thresholds.
    pub fn command_line(&self, rsp_dir: &Path) -> Result<String> {
        let stem = self
            .output
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "task".to_string());

        let inputs_str = self.joined_inputs();
        let mut args = self.arguments.replace(OUTPUT, &quote_path(&self.output));

        if inputs_str.len() > MAX_INPUT_LIST_LEN && args.contains(ALL_INPUTS) {
            let rsp = rsp_dir.join(format!("{}.rsp", stem));
            write_response_file(&rsp, self.inputs.iter().map(|p| normalize_path(p)))?;
            args = args.replace(ALL_INPUTS, &format!("@{}", normalize_path(&rsp)));
        } else {
            args = args.replace(ALL_INPUTS, &inputs_str);
        }

        let first = self.inputs.first().map(|p| quote_path(p)).unwrap_or_default();
        let full_len =
            quote_path(&self.executable).len() + 1 + args.replace(FIRST_INPUT, &first).len();

        if full_len > MAX_COMMAND_LEN
            && let Some((head, tail)) = args.split_once(FIRST_INPUT)
        {
            // Keep everything through the first input on the command line;
            // externalize the rest.
            let head = head.to_string();
            let tail = tail.to_string();
            let rsp = rsp_dir.join(format!("{}.opts.rsp", stem));
            write_response_file(&rsp, split_command(&tail).into_iter())?;
            args = format!("{}{} @{}", head, first, normalize_path(&rsp));
        } else {
            args = args.replace(FIRST_INPUT, &first);
        }

        Ok(format!("{} {}", quote_path(&self.executable), args))
    }
}

/// Forward-slash normalized path string.
pub fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Normalized path, quoted when it contains whitespace.
pub fn quote_path(path: &Path) -> String {
    let s = normalize_path(path);
    if s.contains(char::is_whitespace) {
        format!("\"{}\"", s)
    } else {
        s
    }
}

/// One argument per line; backslashes normalized, embedded quotes
/// escaped so the tool reading the file reconstructs the original
/// arguments in order.
fn write_response_file<I, S>(path: &Path, args: I) -> Result<()>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let mut text = String::new();
    for arg in args {
        let line = arg.as_ref().replace('\\', "/").replace('"', "\\\"");
        text.push_str(&line);
        text.push('\n');
    }
    fs::write(path, text)
        .with_context(|| format!("Failed to write response file {}", path.display()))
}

/// Split a rendered command string into arguments, honoring double
/// quotes.
pub fn split_command(cmd: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in cmd.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_task() -> BuildTask {
        BuildTask::new(
            "/tc/gcc",
            format!("-c {} -o {} -O2", FIRST_INPUT, OUTPUT),
            vec![PathBuf::from("src/main.c")],
            "obj/main.o",
        )
    }

    #[test]
    fn test_rendered_command_substitutes_placeholders() {
        let cmd = compile_task().rendered_command();
        assert_eq!(cmd, "/tc/gcc -c src/main.c -o obj/main.o -O2");
    }

    #[test]
    fn test_paths_normalized_to_forward_slashes() {
        let task = BuildTask::new(
            "/tc/gcc",
            format!("-c {} -o {}", FIRST_INPUT, OUTPUT),
            vec![PathBuf::from("src\\drivers\\uart.c")],
            "obj\\uart.o",
        );
        let cmd = task.rendered_command();
        assert!(cmd.contains("src/drivers/uart.c"));
        assert!(!cmd.contains('\\'));
    }

    #[test]
    fn test_with_output_suffix_is_a_new_value() {
        let task = compile_task();
        let renamed = task.with_output_suffix(1);
        assert_eq!(renamed.output, PathBuf::from("obj/main_1.o"));
        // Original untouched.
        assert_eq!(task.output, PathBuf::from("obj/main.o"));
    }

    #[test]
    fn test_split_command_honors_quotes() {
        let args = split_command(r#"-c "a dir/x.c" -o x.o"#);
        assert_eq!(args, vec!["-c", "a dir/x.c", "-o", "x.o"]);
    }

    #[test]
    fn test_short_input_list_stays_inline() {
        let dir = std::env::temp_dir().join("bspcheck_task_inline");
        std::fs::create_dir_all(&dir).unwrap();
        let task = BuildTask::new(
            "/tc/gcc",
            format!("{} -o {}", ALL_INPUTS, OUTPUT),
            vec![PathBuf::from("a.o"), PathBuf::from("b.o")],
            "out.elf",
        );
        let cmd = task.command_line(&dir).unwrap();
        assert!(cmd.contains("a.o b.o"));
        assert!(!cmd.contains('@'));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_long_input_list_moves_to_response_file() {
        let dir = std::env::temp_dir().join("bspcheck_task_rsp");
        std::fs::create_dir_all(&dir).unwrap();

        let inputs: Vec<PathBuf> = (0..400)
            .map(|i| PathBuf::from(format!("obj/some_long_object_name_{:04}.o", i)))
            .collect();
        let task = BuildTask::new(
            "/tc/gcc",
            format!("{} -o {}", ALL_INPUTS, OUTPUT),
            inputs.clone(),
            dir.join("out.elf"),
        );

        let cmd = task.command_line(&dir).unwrap();
        assert!(cmd.contains("@"), "expected response-file indirection: {}", cmd);

        // Substituting the file contents back reproduces the list
        // verbatim and in order.
        let rsp = dir.join("out.rsp");
        let text = std::fs::read_to_string(&rsp).unwrap();
        let listed: Vec<String> = text.lines().map(str::to_string).collect();
        let expected: Vec<String> = inputs.iter().map(|p| normalize_path(p)).collect();
        assert_eq!(listed, expected);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_oversized_command_externalizes_trailing_args() {
        let dir = std::env::temp_dir().join("bspcheck_task_opts_rsp");
        std::fs::create_dir_all(&dir).unwrap();

        let long_flags: String = (0..500)
            .map(|i| format!("-DLONG_MACRO_NUMBER_{}=VALUE_{}", i, i))
            .collect::<Vec<_>>()
            .join(" ");
        let task = BuildTask::new(
            "/tc/gcc",
            format!("-c {} -o {} {}", FIRST_INPUT, OUTPUT, long_flags),
            vec![PathBuf::from("src/main.c")],
            dir.join("main.o"),
        );

        let cmd = task.command_line(&dir).unwrap();
        assert!(cmd.len() < MAX_COMMAND_LEN);
        assert!(cmd.contains("src/main.c"));
        assert!(cmd.contains(".opts.rsp"));

        let text = std::fs::read_to_string(dir.join("main.opts.rsp")).unwrap();
        assert!(text.lines().any(|l| l == "-DLONG_MACRO_NUMBER_0=VALUE_0"));
        assert!(text.lines().any(|l| l == "-DLONG_MACRO_NUMBER_499=VALUE_499"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_response_file_escapes_quotes() {
        let dir = std::env::temp_dir().join("bspcheck_task_quotes");
        std::fs::create_dir_all(&dir).unwrap();
        let inputs: Vec<PathBuf> = (0..300)
            .map(|i| PathBuf::from(format!("objects_with_very_long_names/file_number_{:05}.o", i)))
            .collect();
        let task = BuildTask::new(
            "/tc/gcc",
            format!("{} -o {}", ALL_INPUTS, OUTPUT),
            inputs,
            dir.join("quoted.elf"),
        );
        task.command_line(&dir).unwrap();
        let text = std::fs::read_to_string(dir.join("quoted.rsp")).unwrap();
        assert!(!text.contains('\\') || text.contains("\\\""));
        std::fs::remove_dir_all(&dir).ok();
    }
}
