//! On-disk user settings (`~/.opspilot/config.toml`).
//!
//! Every field is optional in the file; missing values fall back to the
//! defaults below. Environment variables take precedence over these values
//! when [`crate::config::Config`] is resolved.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Directory holding settings and session history.
pub fn opspilot_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".opspilot")
}

/// User settings persisted as TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub agent: AgentSettings,
    pub sandbox: SandboxSettings,
    pub safety: SafetySettings,
    pub history: HistorySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmSettings {
    /// Provider preset: openai, openrouter, anthropic, zhipu.
    pub provider: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub plan_model: Option<String>,
    pub build_model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            base_url: None,
            plan_model: None,
            build_model: None,
            max_tokens: 4000,
            temperature: 0.7,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub turn_timeout_secs: Option<u64>,
    /// "plan" or "build".
    pub mode: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            turn_timeout_secs: None,
            mode: "plan".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxSettings {
    /// Defaults to the current directory when unset.
    pub workspace: Option<PathBuf>,
    pub command_timeout_secs: u64,
    pub max_command_timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            workspace: None,
            command_timeout_secs: 30,
            max_command_timeout_secs: 600,
            max_output_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetySettings {
    /// TOML rule table replacing the built-in rules.
    pub rules_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HistorySettings {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    /// Sessions kept on disk; older ones are pruned at start. 0 keeps all.
    pub max_sessions: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_sessions: 50,
        }
    }
}

impl Settings {
    /// Default settings file location.
    pub fn default_path() -> PathBuf {
        opspilot_dir().join("config.toml")
    }

    /// Load settings from the default location. A missing file yields defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Load settings from `path`. A missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents).map_err(|e| {
                ConfigError::ParseError(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Write settings to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [llm]
            provider = "openrouter"

            [agent]
            max_iterations = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.llm.provider, "openrouter");
        assert_eq!(settings.llm.max_tokens, 4000);
        assert_eq!(settings.agent.max_iterations, 5);
        assert_eq!(settings.agent.mode, "plan");
        assert_eq!(settings.sandbox.command_timeout_secs, 30);
        assert!(settings.history.enabled);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut settings = Settings::default();
        settings.sandbox.max_output_bytes = 1024;
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.sandbox.max_output_bytes, 1024);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[llm\nprovider = ").unwrap();
        let err = Settings::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }
}
