//! Run report: the persistent `TestReport.txt` and the console summary
//! table.
//!
//! The report is the user-facing verdict of a run. Per sample it lists
//! how many devices passed and names every device that failed; skipped
//! devices are listed but never counted.

use anyhow::{Context, Result};
use colored::*;
use std::cmp;
use std::fs;
use std::path::Path;

#[derive(Debug, Default)]
pub struct SampleOutcome {
    pub name: String,
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl SampleOutcome {
    pub fn new(name: &str) -> SampleOutcome {
        SampleOutcome {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// A sample that ran nowhere signals a job-file mistake.
    pub fn ran_anywhere(&self) -> bool {
        !self.passed.is_empty() || !self.failed.is_empty()
    }
}

pub fn write_report(path: &Path, outcomes: &[SampleOutcome]) -> Result<()> {
    let mut text = String::from("BSP validation report\n=====================\n");
    for outcome in outcomes {
        text.push_str(&format!(
            "\nSample: {}\n  Passed: {} device(s)\n",
            outcome.name,
            outcome.passed.len()
        ));
        if !outcome.failed.is_empty() {
            text.push_str(&format!("  Failed: {} device(s)\n", outcome.failed.len()));
            for dev in &outcome.failed {
                text.push_str(&format!("    FAILED {}\n", dev));
            }
        }
        if !outcome.skipped.is_empty() {
            text.push_str(&format!(
                "  Skipped: {}\n",
                outcome.skipped.join(", ")
            ));
        }
    }
    fs::write(path, text).with_context(|| format!("Failed to write report {}", path.display()))
}

/// Box-drawing summary, one row per sample, sized to the terminal.
pub fn print_summary(outcomes: &[SampleOutcome]) {
    let headers = ["Sample", "Passed", "Failed", "Skipped"];
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();

    let rows: Vec<[String; 4]> = outcomes
        .iter()
        .map(|o| {
            [
                o.name.clone(),
                o.passed.len().to_string(),
                o.failed.len().to_string(),
                o.skipped.len().to_string(),
            ]
        })
        .collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = cmp::max(widths[i], cell.chars().count());
        }
    }

    // Shrink the sample column if the terminal is narrow.
    let term_width = console::Term::stdout().size().1 as usize;
    let overhead = 3 * widths.len() + 1;
    while widths.iter().sum::<usize>() + overhead > term_width && widths[0] > 8 {
        widths[0] -= 1;
    }

    let sep = |l: &str, m: &str, r: &str| {
        let mut s = String::from(l);
        for (i, w) in widths.iter().enumerate() {
            s.push_str(&"─".repeat(w + 2));
            s.push_str(if i + 1 < widths.len() { m } else { r });
        }
        s
    };

    println!("{}", sep("┌", "┬", "┐"));
    print!("│");
    for (i, h) in headers.iter().enumerate() {
        let pad = widths[i].saturating_sub(h.chars().count());
        print!(" {}{} │", h.bold(), " ".repeat(pad));
    }
    println!();
    println!("{}", sep("├", "┼", "┤"));
    for (outcome, row) in outcomes.iter().zip(&rows) {
        print!("│");
        for (i, cell) in row.iter().enumerate() {
            let shown = truncate(cell, widths[i]);
            let colored_cell = match i {
                1 if !outcome.passed.is_empty() => shown.green().to_string(),
                2 if !outcome.failed.is_empty() => shown.red().to_string(),
                3 if !outcome.skipped.is_empty() => shown.yellow().to_string(),
                _ => shown.clone(),
            };
            let pad = widths[i].saturating_sub(shown.chars().count());
            print!(" {}{} │", colored_cell, " ".repeat(pad));
        }
        println!();
    }
    println!("{}", sep("└", "┴", "┘"));
}

fn truncate(s: &str, max_width: usize) -> String {
    if s.chars().count() > max_width {
        let mut out: String = s.chars().take(max_width.saturating_sub(3)).collect();
        out.push_str("...");
        out
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes() -> Vec<SampleOutcome> {
        vec![
            SampleOutcome {
                name: "Blink".to_string(),
                passed: vec!["STM32F407VG".to_string(), "STM32F411RE".to_string()],
                failed: vec!["STM32F429ZI".to_string()],
                skipped: vec![],
            },
            SampleOutcome {
                name: "USB_Echo".to_string(),
                passed: vec![],
                failed: vec![],
                skipped: vec!["STM32F407VG".to_string()],
            },
        ]
    }

    #[test]
    fn test_report_names_every_failed_device() {
        let dir = std::env::temp_dir().join("bspcheck_report_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("TestReport.txt");

        write_report(&path, &outcomes()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();

        assert!(text.contains("Sample: Blink"));
        assert!(text.contains("Passed: 2 device(s)"));
        assert!(text.contains("FAILED STM32F429ZI"));
        assert!(!text.contains("FAILED STM32F407VG"));
        assert!(text.contains("Skipped: STM32F407VG"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_ran_anywhere() {
        let all = outcomes();
        assert!(all[0].ran_anywhere());
        // Only skips: did not run anywhere.
        assert!(!all[1].ran_anywhere());
        assert!(!SampleOutcome::new("empty").ran_anywhere());
    }

    #[test]
    fn test_truncate_marks_elision() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("averylongsamplename", 10), "averylo...");
    }
}
