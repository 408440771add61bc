//! True-dependency extraction from a finished build.
//!
//! Downstream packaging wants the minimal file set a sample actually
//! needs, which only the build itself can tell us: the compiler's `.d`
//! files list every header that was really included, `.incbin`
//! directives pull in binary resources the object files reference, and
//! linker scripts can chain into auxiliary scripts.

use anyhow::Result;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Levels of `dummy/` nesting probed below a source's directory when
/// resolving an `.incbin` reference. The reference is relative to a
/// file the data model no longer remembers, so this is a bounded guess;
/// it breaks for resources nested deeper or laid out differently.
const INCBIN_PROBE_DEPTH: usize = 5;

/// Union of everything the build consumed. Sorted and deduplicated.
pub fn collect_dependencies(
    work_dir: &Path,
    sources: &[PathBuf],
    aux_linker_scripts: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    let depfiles: Vec<PathBuf> = WalkDir::new(work_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "d"))
        .map(|e| e.path().to_path_buf())
        .collect();

    let mut deps: BTreeSet<PathBuf> = depfiles
        .par_iter()
        .filter_map(|d| parse_depfile(d).ok())
        .flatten()
        .collect();

    for src in sources {
        deps.insert(src.clone());
        let src_dir = src.parent().unwrap_or_else(|| Path::new("."));
        for reference in incbin_references(src) {
            if let Some(found) = probe_incbin(src_dir, &reference) {
                deps.insert(found);
            }
        }
    }

    deps.extend(aux_linker_scripts.iter().cloned());
    Ok(deps.into_iter().collect())
}

/// Parse a make-style dependency file: `obj.o: src.c hdr.h \` with
/// backslash line continuations.
pub fn parse_depfile(path: &Path) -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string(path)?;
    let flat = content.replace("\\\r\n", " ").replace("\\\n", " ");

    let mut out = Vec::new();
    if let Some((_, deps)) = flat.split_once(':') {
        for dep in deps.split_whitespace() {
            if dep != "\\" {
                out.push(PathBuf::from(dep));
            }
        }
    }
    Ok(out)
}

/// Paths referenced by `.incbin "..."` directives in a source file.
pub fn incbin_references(source: &Path) -> Vec<String> {
    let Ok(content) = fs::read_to_string(source) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(".incbin")
            && let Some(start) = rest.find('"')
            && let Some(end) = rest[start + 1..].find('"')
        {
            out.push(rest[start + 1..start + 1 + end].to_string());
        }
    }
    out
}

/// Resolve an `.incbin` reference: try it relative to the source's own
/// directory, then under up to [`INCBIN_PROBE_DEPTH`] nested `dummy/`
/// levels, stopping at the first hit on disk.
pub fn probe_incbin(source_dir: &Path, reference: &str) -> Option<PathBuf> {
    let mut base = source_dir.to_path_buf();
    for _ in 0..=INCBIN_PROBE_DEPTH {
        let candidate = base.join(reference);
        if candidate.exists() {
            return Some(candidate);
        }
        base = base.join("dummy");
    }
    None
}
