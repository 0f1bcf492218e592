/// Toolchain Capability - uniform `{compile, run}` interface per language
///
/// **Critical Architectural Boundary:**
/// - A toolchain knows HOW to build and execute one language
/// - It does NOT know scoring rules or the job store
/// - It returns raw outputs for the evaluator to judge
///
/// Adding a language means adding a `languages.json` entry (or a new
/// `Toolchain` impl), never touching the pipeline.
use anyhow::Result;
use async_trait::async_trait;
use psjudge_common::languages::Backend;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::LanguageConfigManager;
use crate::engine::DockerToolchain;
use crate::evaluator::TestExecutionOutput;
use crate::process::ProcessToolchain;

/// Result of the compile step. A judged failure is `success == false`,
/// never an `Err`.
pub struct CompileOutcome {
    pub success: bool,
    pub timed_out: bool,
    pub log: String,
    /// Present iff `success`.
    pub program: Option<Box<dyn Program>>,
}

impl CompileOutcome {
    pub fn failed(log: String, timed_out: bool) -> Self {
        Self {
            success: false,
            timed_out,
            log,
            program: None,
        }
    }

    pub fn succeeded(log: String, program: Box<dyn Program>) -> Self {
        Self {
            success: true,
            timed_out: false,
            log,
            program: Some(program),
        }
    }
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    fn name(&self) -> &str;

    /// Build `source` inside `workdir`, which is empty and owned by the caller
    /// for the duration of the job.
    async fn compile(&self, source: &str, workdir: &Path) -> Result<CompileOutcome>;
}

/// Handle to a compiled or interpreted program, runnable once per test case.
#[async_trait]
pub trait Program: Send + Sync {
    async fn run(&self, input: &str) -> Result<TestExecutionOutput>;
}

/// Mapping from language name to toolchain implementation
#[derive(Clone, Default)]
pub struct ToolchainRegistry {
    toolchains: HashMap<String, Arc<dyn Toolchain>>,
}

impl ToolchainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(manager: &LanguageConfigManager) -> Result<Self> {
        let mut registry = Self::new();
        let mut docker: Option<bollard::Docker> = None;

        for config in manager.configs() {
            let toolchain: Arc<dyn Toolchain> = match config.backend {
                Backend::Process => Arc::new(ProcessToolchain::new(config.clone())),
                Backend::Docker => {
                    let client = match &docker {
                        Some(client) => client.clone(),
                        None => {
                            let client = DockerToolchain::connect()?;
                            docker = Some(client.clone());
                            client
                        }
                    };
                    Arc::new(DockerToolchain::new(client, config.clone()))
                }
            };
            info!(
                language = %config.name,
                version = %config.version,
                backend = ?config.backend,
                "Registered toolchain"
            );
            registry.insert(toolchain);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, toolchain: Arc<dyn Toolchain>) {
        self.toolchains.insert(toolchain.name().to_string(), toolchain);
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn Toolchain>> {
        self.toolchains.get(language).cloned()
    }

    pub fn languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.toolchains.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Substitute `{source}`, `{exe}` and `{dir}` in an argv template.
pub fn render_command(template: &[String], source: &str, exe: &str, dir: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{source}", source)
                .replace("{exe}", exe)
                .replace("{dir}", dir)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_command() {
        let template: Vec<String> = ["fpc", "-Mtp", "-o{exe}", "{source}", "-FU{dir}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let argv = render_command(&template, "/w/a.pas", "/w/a", "/w");
        assert_eq!(argv, vec!["fpc", "-Mtp", "-o/w/a", "/w/a.pas", "-FU/w"]);
    }

    #[test]
    fn test_registry_lookup() {
        let file: psjudge_common::languages::LanguagesFile = serde_json::from_str(
            r#"{"languages": [{"name": "sh", "source_file": "main.sh", "run": ["sh", "{source}"]}]}"#,
        )
        .unwrap();
        let registry =
            ToolchainRegistry::from_config(&LanguageConfigManager::from_file(file)).unwrap();

        assert_eq!(registry.languages(), vec!["sh"]);
        assert!(registry.get("sh").is_some());
        assert!(registry.get("cobol").is_none());
    }
}
