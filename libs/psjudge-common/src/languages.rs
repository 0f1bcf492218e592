// Toolchain definitions stored in config/languages.json.
// Shared by the worker (which executes them) and the cli (which edits them).

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{JudgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Local subprocess, optionally wrapped in `prlimit`
    #[default]
    Process,
    /// Docker container per job
    Docker,
}

/// rlimits applied to process-backed toolchains when `use_prlimit` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub open_files: u32,
    pub processes: u32,
    pub file_locks: u32,
    pub cpu_seconds: u32,
    pub address_space_mb: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            open_files: 8,
            processes: 64,
            file_locks: 8,
            cpu_seconds: 2,
            address_space_mb: 256,
        }
    }
}

impl ResourceLimits {
    pub fn prlimit_args(&self) -> Vec<String> {
        vec![
            format!("--nofile={}", self.open_files),
            format!("--nproc={}", self.processes),
            format!("--locks={}", self.file_locks),
            format!("--cpu={}", self.cpu_seconds),
            format!("--as={}", u64::from(self.address_space_mb) * 1024 * 1024),
        ]
    }
}

/// One language toolchain.
///
/// Command templates accept the placeholders `{source}`, `{exe}` and `{dir}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub source_file: String,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub image: Option<String>,
    /// Absent for interpreted languages without a syntax check.
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
    #[serde(default = "default_run_timeout_ms")]
    pub run_timeout_ms: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default)]
    pub use_prlimit: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
}

fn default_version() -> String {
    "latest".to_string()
}

fn default_compile_timeout_ms() -> u64 {
    10_000
}

fn default_run_timeout_ms() -> u64 {
    2_000
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_memory_limit_mb() -> u32 {
    256
}

fn default_cpu_limit() -> f32 {
    0.5
}

impl LanguageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(JudgeError::Config("language name cannot be empty".into()));
        }
        if self.source_file.trim().is_empty() {
            return Err(JudgeError::Config(format!(
                "language '{}' has no source_file",
                self.name
            )));
        }
        if self.run.is_empty() {
            return Err(JudgeError::Config(format!(
                "language '{}' has an empty run command",
                self.name
            )));
        }
        if matches!(&self.compile, Some(cmd) if cmd.is_empty()) {
            return Err(JudgeError::Config(format!(
                "language '{}' has an empty compile command",
                self.name
            )));
        }
        if self.backend == Backend::Docker && self.image.is_none() {
            return Err(JudgeError::Config(format!(
                "docker language '{}' requires an image",
                self.name
            )));
        }
        if self.compile_timeout_ms == 0 || self.run_timeout_ms == 0 {
            return Err(JudgeError::Config(format!(
                "language '{}' has a zero timeout",
                self.name
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguagesFile {
    pub languages: Vec<LanguageConfig>,
}

impl LanguagesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            JudgeError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let file: LanguagesFile = serde_json::from_str(&content)?;
        file.validate()?;
        Ok(file)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                JudgeError::Config(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .map_err(|e| JudgeError::Config(format!("failed to write {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for lang in &self.languages {
            lang.validate()?;
            if !seen.insert(lang.name.as_str()) {
                return Err(JudgeError::Config(format!(
                    "language '{}' is defined twice",
                    lang.name
                )));
            }
        }
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&LanguageConfig> {
        self.languages.iter().find(|l| l.name == name)
    }
}
