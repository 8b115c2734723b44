//! Configuration management for roamr.
//!
//! Configuration is loaded from `~/.config/roamr/config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backend configuration.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Chat model and sampling settings.
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Which inference server to talk to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Ollama local backend.
    Ollama {
        /// Ollama host URL (default: http://localhost:11434).
        #[serde(default = "default_ollama_host")]
        host: String,
    },
    /// Any server speaking the OpenAI chat completions API.
    OpenAI {
        /// Server URL without the `/v1` suffix (default: http://localhost:8080).
        #[serde(default = "default_openai_host")]
        host: String,
        /// API key (prefer OPENAI_API_KEY env var; local servers need none).
        #[serde(default)]
        api_key: Option<String>,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Ollama {
            host: default_ollama_host(),
        }
    }
}

fn default_ollama_host() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_host() -> String {
    "http://localhost:8080".to_string()
}

/// Chat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Name of the model to load, matched exactly against the backend's list.
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Upper bound on generated tokens per reply.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_model() -> String {
    "smollm2:360m".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    512
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("roamr"))
            .context("Could not determine config directory")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get the log file path used while the chat screen owns the terminal.
    pub fn log_path() -> Result<PathBuf> {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|p| p.join("roamr").join("roamr.log"))
            .context("Could not determine data directory")
    }

    /// Load configuration from file, using defaults if not found.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file, using defaults if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply a `--model` override from the command line.
    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model {
            self.chat.model = model;
        }
        self
    }

    /// Get the backend type as a string.
    pub fn backend_type(&self) -> &'static str {
        match &self.backend {
            BackendConfig::Ollama { .. } => "ollama",
            BackendConfig::OpenAI { .. } => "openai",
        }
    }

    /// Get the backend host.
    pub fn host(&self) -> &str {
        match &self.backend {
            BackendConfig::Ollama { host } => host,
            BackendConfig::OpenAI { host, .. } => host,
        }
    }

    /// Get the model name.
    pub fn model_name(&self) -> &str {
        &self.chat.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(matches!(config.backend, BackendConfig::Ollama { .. }));
        assert_eq!(config.model_name(), "smollm2:360m");
        assert_eq!(config.host(), "http://localhost:11434");
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("ollama"));
        assert!(toml.contains("smollm2:360m"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
[backend]
type = "openai"
host = "http://127.0.0.1:1234"

[chat]
model = "SmolLM2 360M Q8_0"
max_tokens = 128
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.backend_type(), "openai");
        assert_eq!(config.host(), "http://127.0.0.1:1234");
        assert_eq!(config.model_name(), "SmolLM2 360M Q8_0");
        assert_eq!(config.chat.max_tokens, 128);
        assert_eq!(config.chat.temperature, 0.7);
    }

    #[test]
    fn test_partial_backend_uses_defaults() {
        let config: Config = toml::from_str("[backend]\ntype = \"ollama\"\n").unwrap();
        assert_eq!(config.host(), "http://localhost:11434");
    }

    #[test]
    fn test_model_override() {
        let config = Config::default().with_model(Some("llama3.2:1b".to_string()));
        assert_eq!(config.model_name(), "llama3.2:1b");
        let config = config.with_model(None);
        assert_eq!(config.model_name(), "llama3.2:1b");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("roamr-test-missing").join("config.toml");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.backend_type(), "ollama");
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("roamr-test-{}", std::process::id()));
        let path = dir.join("config.toml");
        let config = Config::default().with_model(Some("qwen2.5:0.5b".to_string()));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.model_name(), "qwen2.5:0.5b");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
