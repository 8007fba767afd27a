//! Experiment configuration file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use emulation_kernel::KernelConfig;

/// Everything a run needs besides the requested roots.
///
/// Loaded from JSON; missing fields fall back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub kernel: KernelConfig,

    /// Directories holding component descriptor files
    pub repositories: Vec<PathBuf>,

    /// Capability → component used when several components provide it
    pub capability_defaults: BTreeMap<String, String>,

    /// Abort automatically once the run has been going this long
    pub deadline_seconds: Option<f64>,

    /// Where results files are written
    pub output_dir: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            repositories: Vec::new(),
            capability_defaults: BTreeMap::new(),
            deadline_seconds: None,
            output_dir: PathBuf::from("."),
        }
    }
}

impl ExperimentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Parse a `capability=component` binding and record it.
    pub fn bind(&mut self, binding: &str) -> Result<()> {
        let (capability, component) = binding
            .split_once('=')
            .filter(|(c, p)| !c.trim().is_empty() && !p.trim().is_empty())
            .with_context(|| format!("invalid binding `{binding}`, expected capability=component"))?;
        self.capability_defaults
            .insert(capability.trim().to_string(), component.trim().to_string());
        Ok(())
    }
}
