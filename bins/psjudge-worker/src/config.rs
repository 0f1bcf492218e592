// Language configuration management for the psjudge worker
use anyhow::{bail, Context, Result};
use psjudge_common::languages::{LanguageConfig, LanguagesFile};
use std::collections::HashMap;
use std::path::Path;

/// Language configuration manager
#[derive(Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let file = LanguagesFile::load(config_path)
            .with_context(|| format!("Failed to load {}", config_path.display()))?;

        Ok(Self::from_file(file))
    }

    pub fn from_file(file: LanguagesFile) -> Self {
        let configs = file
            .languages
            .into_iter()
            .map(|lang| (lang.name.clone(), lang))
            .collect();
        Self { configs }
    }

    pub fn configs(&self) -> impl Iterator<Item = &LanguageConfig> {
        self.configs.values()
    }

    /// List all supported languages, sorted
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_file_indexes_by_name() {
        let file: LanguagesFile = serde_json::from_str(
            r#"{"languages": [
                {"name": "python", "source_file": "main.py", "run": ["python3", "{source}"]},
                {"name": "c++", "source_file": "a.cpp", "compile": ["g++", "{source}", "-o", "{exe}"], "run": ["{exe}"]}
            ]}"#,
        )
        .unwrap();
        let manager = LanguageConfigManager::from_file(file);

        assert_eq!(manager.list_languages(), vec!["c++", "python"]);
        let python = manager.configs().find(|c| c.name == "python").unwrap();
        assert!(python.compile.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let result = LanguageConfigManager::load(Path::new("/nonexistent/languages.json"));
        assert!(result.is_err());
    }
}
