//! BSP manifest and register database loading.
//!
//! The project-assembly layer that resolves vendor project formats is out
//! of scope here; its output is a `bsp.json` manifest at the BSP root that
//! lists every device with its resolved source files, include directories,
//! macros and linker script. This module only reads that contract.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug)]
pub struct BspManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub families: Vec<FamilyRecord>,
    pub devices: Vec<DeviceRecord>,
    /// Path of the register database relative to the BSP root.
    #[serde(default)]
    pub register_db: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct FamilyRecord {
    pub name: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[derive(Deserialize, Debug)]
pub struct DeviceRecord {
    pub id: String,
    #[serde(default)]
    pub family: String,
    /// Device-level sources (startup code, system init), relative to the
    /// BSP root.
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub include_dirs: Vec<String>,
    /// Preprocessor macros, `NAME` or `NAME=VALUE`.
    #[serde(default)]
    pub macros: Vec<String>,
    pub linker_script: String,
    /// Additional linker scripts pulled in via INCLUDE directives.
    #[serde(default)]
    pub aux_linker_scripts: Vec<String>,
    /// Prebuilt static libraries linked into every sample.
    #[serde(default)]
    pub libraries: Vec<String>,
    /// Device builds a TrustZone secure image; export the CMSE veneers.
    #[serde(default)]
    pub cmse: bool,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

/// Per-build flag bundle consumed read-only by the build graph.
#[derive(Debug, Clone, Default)]
pub struct ToolFlags {
    pub include_dirs: Vec<PathBuf>,
    pub macros: Vec<String>,
    pub cflags: Vec<String>,
    pub cxxflags: Vec<String>,
    pub ldflags: Vec<String>,
    pub linker_script: PathBuf,
    pub aux_linker_scripts: Vec<PathBuf>,
    pub libraries: Vec<PathBuf>,
}

impl BspManifest {
    pub fn load(bsp_dir: &Path) -> Result<BspManifest> {
        let path = bsp_dir.join("bsp.json");
        let text = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read BSP manifest {}", path.display()))?;
        let manifest: BspManifest = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse BSP manifest {}", path.display()))?;
        for dev in &manifest.devices {
            if dev.id.trim().is_empty() {
                anyhow::bail!("BSP manifest {} contains a device with an empty id", path.display());
            }
        }
        Ok(manifest)
    }

    pub fn family_settings(&self, family: &str) -> Option<&BTreeMap<String, String>> {
        self.families
            .iter()
            .find(|f| f.name == family)
            .map(|f| &f.settings)
    }
}

impl DeviceRecord {
    /// Resolve this device's flag bundle against the BSP root and the
    /// merged configuration. Macros matching an `undefined_macros` pattern
    /// are dropped from the command line.
    pub fn tool_flags(
        &self,
        bsp_dir: &Path,
        cfg: &BTreeMap<String, String>,
        dropped_macros: &[Regex],
    ) -> ToolFlags {
        let expand = |v: &str| crate::job::expand_value(cfg, v);
        let split_cfg = |key: &str| -> Vec<String> {
            cfg.get(key)
                .map(|v| expand(v).split_whitespace().map(str::to_string).collect())
                .unwrap_or_default()
        };

        let macros = self
            .macros
            .iter()
            .map(|m| expand(m))
            .filter(|m| {
                let name = m.split('=').next().unwrap_or(m);
                !dropped_macros.iter().any(|re| re.is_match(name))
            })
            .collect();

        let mut cflags = split_cfg("ARCHFLAGS");
        cflags.extend(split_cfg("CFLAGS"));
        let mut cxxflags = split_cfg("ARCHFLAGS");
        cxxflags.extend(split_cfg("CXXFLAGS"));
        let mut ldflags = split_cfg("ARCHFLAGS");
        ldflags.extend(split_cfg("LDFLAGS"));

        ToolFlags {
            include_dirs: self
                .include_dirs
                .iter()
                .map(|d| bsp_dir.join(expand(d)))
                .collect(),
            macros,
            cflags,
            cxxflags,
            ldflags,
            linker_script: bsp_dir.join(expand(&self.linker_script)),
            aux_linker_scripts: self
                .aux_linker_scripts
                .iter()
                .map(|s| bsp_dir.join(expand(s)))
                .collect(),
            libraries: self.libraries.iter().map(|l| bsp_dir.join(expand(l))).collect(),
        }
    }
}

/// Register database: register-set name -> register name -> byte offset.
/// Produced by the header-scraping subsystem, consumed read-only here.
#[derive(Deserialize, Debug, Default)]
pub struct RegisterDatabase {
    #[serde(default)]
    pub sets: BTreeMap<String, RegisterSet>,
}

#[derive(Deserialize, Debug)]
pub struct RegisterSet {
    /// C struct type the header declares for this set.
    pub struct_name: String,
    pub registers: BTreeMap<String, u64>,
}

impl RegisterDatabase {
    pub fn load(path: &Path) -> Result<RegisterDatabase> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read register database {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse register database {}", path.display()))
    }
}
