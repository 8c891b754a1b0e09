// Language configuration management
use anyhow::{bail, Context, Result};
use prajna_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Image shared by both reference languages.
pub const DEFAULT_IMAGE: &str = "online-judge-env";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: Language,
    pub image: String,
    pub source_extension: String,
    /// Build command, `{source}` and `{binary}` substituted. Present iff compiled.
    #[serde(default)]
    pub compile: Option<Vec<String>>,
    /// Run command, same placeholders.
    pub run: Vec<String>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub cpu_limit: Option<f64>,
}

/// Paths of one run's files, as seen by the executed command.
#[derive(Debug, Clone)]
pub struct RunFiles {
    pub source: String,
    pub binary: String,
}

impl LanguageConfig {
    pub fn compile_command(&self, files: &RunFiles) -> Option<Vec<String>> {
        self.compile.as_ref().map(|args| render(args, files))
    }

    pub fn run_command(&self, files: &RunFiles) -> Vec<String> {
        render(&self.run, files)
    }
}

fn render(args: &[String], files: &RunFiles) -> Vec<String> {
    args.iter()
        .map(|arg| {
            arg.replace("{source}", &files.source)
                .replace("{binary}", &files.binary)
        })
        .collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read languages.json")?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .context("Failed to parse languages.json")?;

        Self::from_configs(languages_json.languages)
    }

    /// Load from `config_path` when present, otherwise fall back to the built-in table.
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            info!(path = %config_path.display(), "No language config file, using built-in table");
            Ok(Self::builtin())
        }
    }

    /// g++ for C++ and python3 for Python, both in the shared judge image.
    pub fn builtin() -> Self {
        let cpp = LanguageConfig {
            name: Language::Cpp,
            image: DEFAULT_IMAGE.to_string(),
            source_extension: "cpp".to_string(),
            compile: Some(
                ["g++", "-std=c++17", "-O2", "{source}", "-o", "{binary}"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            run: vec!["{binary}".to_string()],
            memory_limit_mb: None,
            cpu_limit: None,
        };
        let python = LanguageConfig {
            name: Language::Python,
            image: DEFAULT_IMAGE.to_string(),
            source_extension: "py".to_string(),
            compile: None,
            run: vec!["python3".to_string(), "{source}".to_string()],
            memory_limit_mb: None,
            cpu_limit: None,
        };

        let configs = [cpp, python].into_iter().map(|c| (c.name, c)).collect();
        Self { configs }
    }

    pub fn from_configs(languages: Vec<LanguageConfig>) -> Result<Self> {
        let mut configs = HashMap::new();
        for lang in languages {
            if lang.run.is_empty() {
                bail!("Language '{}' has an empty run command", lang.name);
            }
            if lang.name.is_compiled() != lang.compile.is_some() {
                bail!(
                    "Language '{}' must {} a compile command",
                    lang.name,
                    if lang.name.is_compiled() { "have" } else { "not have" }
                );
            }
            if configs.insert(lang.name, lang).is_some() {
                bail!("Language configured twice in languages.json");
            }
        }

        if configs.is_empty() {
            bail!("No languages configured");
        }

        Ok(Self { configs })
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageConfig> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// Get Docker image for a language
    pub fn get_image(&self, language: &Language) -> Result<String> {
        Ok(self.get_config(language)?.image.clone())
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().map(|l| l.to_string()).collect();
        names.sort();
        names
    }
}
