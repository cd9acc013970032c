use std::time::Duration;

use crate::agent::Mode;
use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Think-Act loop configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model rounds allowed per turn before the turn fails.
    pub max_iterations: usize,
    /// Wall-clock budget for a whole turn.
    pub turn_timeout: Option<Duration>,
    pub initial_mode: Mode,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            turn_timeout: None,
            initial_mode: Mode::Plan,
        }
    }
}

impl AgentConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let max_iterations =
            parse_optional_env("OPSPILOT_MAX_ITERATIONS", settings.agent.max_iterations)?;
        if max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OPSPILOT_MAX_ITERATIONS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let turn_timeout = match optional_env("OPSPILOT_TURN_TIMEOUT_SECS")? {
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|e| {
                ConfigError::InvalidValue {
                    key: "OPSPILOT_TURN_TIMEOUT_SECS".to_string(),
                    message: format!("must be a positive integer: {e}"),
                }
            })?),
            None => settings.agent.turn_timeout_secs,
        }
        .map(Duration::from_secs);

        let mode_raw = optional_env("OPSPILOT_MODE")?.unwrap_or_else(|| settings.agent.mode.clone());
        let initial_mode = mode_raw
            .parse::<Mode>()
            .map_err(|message| ConfigError::InvalidValue {
                key: "OPSPILOT_MODE".to_string(),
                message,
            })?;

        Ok(Self {
            max_iterations,
            turn_timeout,
            initial_mode,
        })
    }
}
