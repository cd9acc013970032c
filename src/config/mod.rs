//! Configuration for OpsPilot.
//!
//! Values are resolved in order: built-in defaults, then the TOML settings
//! file, then environment variables (a `.env` file is loaded first). The
//! CLI applies its flags on top of the resolved [`Config`].

mod agent;
pub(crate) mod helpers;
mod llm;
mod sandbox;

use std::path::{Path, PathBuf};

pub use self::agent::AgentConfig;
pub use self::llm::{LlmConfig, ProviderPreset};
use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;
use crate::sandbox::SandboxConfig;
use crate::settings::{Settings, opspilot_dir};

/// Safety gate configuration.
#[derive(Debug, Clone, Default)]
pub struct SafetyConfig {
    /// TOML rule table replacing the built-in rules.
    pub rules_file: Option<PathBuf>,
}

/// Transcript persistence configuration.
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub dir: PathBuf,
    /// Retention limit; 0 disables pruning.
    pub max_sessions: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: opspilot_dir().join("sessions"),
            max_sessions: 50,
        }
    }
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub safety: SafetyConfig,
    pub history: HistoryConfig,
}

impl Config {
    /// Load `.env`, the default settings file, and the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(None)
    }

    /// Like [`Config::from_env`] but reads settings from `settings_path` when given.
    pub fn from_env_with(settings_path: Option<&Path>) -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let settings = match settings_path {
            Some(path) => Settings::load_from(path)?,
            None => Settings::load()?,
        };
        Self::resolve(&settings)
    }

    /// Resolve against already-loaded settings, applying environment overrides.
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let rules_file = optional_env("OPSPILOT_SAFETY_RULES")?
            .map(PathBuf::from)
            .or_else(|| settings.safety.rules_file.clone());

        let history_dir = optional_env("OPSPILOT_HISTORY_DIR")?
            .map(PathBuf::from)
            .or_else(|| settings.history.dir.clone())
            .unwrap_or_else(|| opspilot_dir().join("sessions"));

        Ok(Self {
            agent: AgentConfig::resolve(settings)?,
            llm: LlmConfig::resolve(settings)?,
            sandbox: sandbox::resolve(settings)?,
            safety: SafetyConfig { rules_file },
            history: HistoryConfig {
                enabled: parse_bool_env("OPSPILOT_HISTORY_ENABLED", settings.history.enabled)?,
                dir: history_dir,
                max_sessions: parse_optional_env(
                    "OPSPILOT_HISTORY_MAX_SESSIONS",
                    settings.history.max_sessions,
                )?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::agent::Mode;
    use crate::config::helpers::ENV_MUTEX;

    fn clear_env() {
        for key in [
            "OPSPILOT_PROVIDER",
            "OPSPILOT_MODE",
            "OPSPILOT_MAX_ITERATIONS",
            "OPSPILOT_TURN_TIMEOUT_SECS",
            "OPSPILOT_WORKSPACE",
            "OPSPILOT_COMMAND_TIMEOUT_SECS",
            "OPSPILOT_MAX_COMMAND_TIMEOUT_SECS",
            "OPSPILOT_MAX_OUTPUT_BYTES",
            "OPSPILOT_SAFETY_RULES",
            "OPSPILOT_HISTORY_DIR",
            "OPSPILOT_HISTORY_ENABLED",
            "OPSPILOT_HISTORY_MAX_SESSIONS",
        ] {
            // SAFETY: Under ENV_MUTEX.
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn defaults_resolve() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.sandbox.workspace = Some(dir.path().to_path_buf());

        let config = Config::resolve(&settings).expect("resolve should succeed");
        assert_eq!(config.agent.max_iterations, 25);
        assert_eq!(config.agent.initial_mode, Mode::Plan);
        assert_eq!(config.agent.turn_timeout, None);
        assert_eq!(config.sandbox.allowed_root, dir.path());
        assert_eq!(config.sandbox.default_timeout, Duration::from_secs(30));
        assert_eq!(config.sandbox.max_output_bytes, 64 * 1024);
        assert!(config.history.enabled);
        assert_eq!(config.history.max_sessions, 50);
        assert!(config.safety.rules_file.is_none());
    }

    #[test]
    fn env_mode_and_iterations_override() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("OPSPILOT_MODE", "build");
            std::env::set_var("OPSPILOT_MAX_ITERATIONS", "4");
            std::env::set_var("OPSPILOT_TURN_TIMEOUT_SECS", "90");
            std::env::set_var("OPSPILOT_HISTORY_ENABLED", "false");
        }

        let config = Config::resolve(&Settings::default()).expect("resolve should succeed");
        assert_eq!(config.agent.initial_mode, Mode::Build);
        assert_eq!(config.agent.max_iterations, 4);
        assert_eq!(config.agent.turn_timeout, Some(Duration::from_secs(90)));
        assert!(!config.history.enabled);

        clear_env();
    }

    #[test]
    fn zero_iterations_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let mut settings = Settings::default();
        settings.agent.max_iterations = 0;
        assert!(Config::resolve(&settings).is_err());
    }

    #[test]
    fn command_timeout_above_max_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let mut settings = Settings::default();
        settings.sandbox.command_timeout_secs = 900;
        settings.sandbox.max_command_timeout_secs = 600;
        let err = Config::resolve(&settings).unwrap_err();
        assert!(err.to_string().contains("OPSPILOT_COMMAND_TIMEOUT_SECS"));
    }

    #[test]
    fn invalid_mode_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_env();

        let mut settings = Settings::default();
        settings.agent.mode = "yolo".to_string();
        assert!(Config::resolve(&settings).is_err());
    }
}
