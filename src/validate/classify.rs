//! Artifact-based result classification.
//!
//! A zero exit code alone proves very little for firmware: a project can
//! "build" into a stub image with no entry point. Four independent
//! guards have to hold before a build counts as a pass.

use crate::exec::BuildLog;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

/// Anything smaller than this is a stub, not firmware.
pub const MIN_IMAGE_SIZE: u64 = 512;

const UNDEFINED_REFERENCE: &str = "undefined reference to";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Passed,
    Failed(String),
}

impl Classification {
    pub fn is_pass(&self) -> bool {
        matches!(self, Classification::Passed)
    }
}

fn main_symbol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // A map line assigning an address to `main`, e.g.
    //   "                0x0000000008000100                main"
    RE.get_or_init(|| Regex::new(r"^\s*0x[0-9A-Fa-f]+\s+main\b").expect("valid regex"))
}

/// Classify one finished build from its artifacts.
///
/// Pass requires all of: zero exit, a map file, a `main` symbol line in
/// the map, and an image of at least [`MIN_IMAGE_SIZE`] bytes. With
/// `ignore_linker_errors`, an otherwise-failed build whose log shows an
/// "undefined reference" diagnostic is promoted to a pass; that mode
/// only cares that everything compiled.
pub fn classify(
    exit_ok: bool,
    map_file: &Path,
    image: &Path,
    log: &BuildLog,
    ignore_linker_errors: bool,
) -> Classification {
    let failure = strict_failure(exit_ok, map_file, image);
    match failure {
        None => Classification::Passed,
        Some(reason) => {
            if ignore_linker_errors && log.contains(UNDEFINED_REFERENCE) {
                return Classification::Passed;
            }
            Classification::Failed(reason)
        }
    }
}

fn strict_failure(exit_ok: bool, map_file: &Path, image: &Path) -> Option<String> {
    if !exit_ok {
        return Some("build tool reported failure".to_string());
    }
    if !map_file.exists() {
        return Some(format!("map file {} was not produced", map_file.display()));
    }
    match map_contains_main(map_file) {
        Ok(true) => {}
        Ok(false) => {
            return Some(format!("no main symbol in {}", map_file.display()));
        }
        Err(e) => return Some(format!("unreadable map file: {}", e)),
    }
    match fs::metadata(image) {
        Ok(meta) if meta.len() >= MIN_IMAGE_SIZE => None,
        Ok(meta) => Some(format!(
            "image {} is only {} bytes",
            image.display(),
            meta.len()
        )),
        Err(_) => Some(format!("image {} was not produced", image.display())),
    }
}

fn map_contains_main(map_file: &Path) -> std::io::Result<bool> {
    let text = fs::read_to_string(map_file)?;
    Ok(text.lines().any(|l| main_symbol_regex().is_match(l)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const GOOD_MAP: &str = "\
Memory Configuration

.text           0x0000000008000000     0x1d2c
                0x0000000008000100                main
                0x0000000008000200                SystemInit
";

    fn fixture(name: &str) -> (PathBuf, BuildLog) {
        let dir = std::env::temp_dir().join("bspcheck_classify_tests").join(name);
        std::fs::remove_dir_all(&dir).ok();
        std::fs::create_dir_all(&dir).unwrap();
        let log = BuildLog::create(dir.join("build.log")).unwrap();
        (dir, log)
    }

    #[test]
    fn test_good_build_passes() {
        let (dir, log) = fixture("good");
        std::fs::write(dir.join("a.map"), GOOD_MAP).unwrap();
        std::fs::write(dir.join("a.bin"), vec![0u8; 600]).unwrap();

        let c = classify(true, &dir.join("a.map"), &dir.join("a.bin"), &log, false);
        assert!(c.is_pass());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_nonzero_exit_fails_despite_artifacts() {
        let (dir, log) = fixture("exit");
        std::fs::write(dir.join("a.map"), GOOD_MAP).unwrap();
        std::fs::write(dir.join("a.bin"), vec![0u8; 600]).unwrap();

        let c = classify(false, &dir.join("a.map"), &dir.join("a.bin"), &log, false);
        assert!(!c.is_pass());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_main_symbol_never_passes() {
        let (dir, log) = fixture("nomain");
        // Exit code zero, map present, but the entry point was garbage
        // collected: "domain" below must not match the main regex.
        std::fs::write(
            dir.join("a.map"),
            "  0x08000000  _start\n  0x08000010  domain\n",
        )
        .unwrap();
        std::fs::write(dir.join("a.bin"), vec![0u8; 600]).unwrap();

        let c = classify(true, &dir.join("a.map"), &dir.join("a.bin"), &log, false);
        assert!(!c.is_pass());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_undersized_image_never_passes() {
        let (dir, log) = fixture("small");
        std::fs::write(dir.join("a.map"), GOOD_MAP).unwrap();
        std::fs::write(dir.join("a.bin"), vec![0u8; 400]).unwrap();

        let c = classify(true, &dir.join("a.map"), &dir.join("a.bin"), &log, false);
        match c {
            Classification::Failed(reason) => assert!(reason.contains("400 bytes")),
            Classification::Passed => panic!("400-byte image classified as pass"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_boundary_image_size_passes() {
        let (dir, log) = fixture("boundary");
        std::fs::write(dir.join("a.map"), GOOD_MAP).unwrap();
        std::fs::write(dir.join("a.bin"), vec![0u8; MIN_IMAGE_SIZE as usize]).unwrap();

        let c = classify(true, &dir.join("a.map"), &dir.join("a.bin"), &log, false);
        assert!(c.is_pass());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_lenient_mode_promotes_undefined_reference_failures() {
        let (dir, log) = fixture("lenient");
        log.append("main.o: in function `main':");
        log.append("main.c:(.text+0x12): undefined reference to `HAL_Init'");

        // No map, no image, nonzero exit: everything failed at link time.
        let c = classify(false, &dir.join("a.map"), &dir.join("a.bin"), &log, true);
        assert!(c.is_pass());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_lenient_mode_does_not_promote_compile_errors() {
        let (dir, log) = fixture("lenient_compile");
        log.append("main.c:3:1: error: unknown type name 'foo'");

        let c = classify(false, &dir.join("a.map"), &dir.join("a.bin"), &log, true);
        assert!(!c.is_pass());
        std::fs::remove_dir_all(&dir).ok();
    }
}
