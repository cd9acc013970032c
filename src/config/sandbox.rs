use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::sandbox::SandboxConfig;
use crate::settings::Settings;

pub(crate) fn resolve(settings: &Settings) -> Result<SandboxConfig, ConfigError> {
    let allowed_root = match optional_env("OPSPILOT_WORKSPACE")? {
        Some(dir) => PathBuf::from(dir),
        None => match &settings.sandbox.workspace {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        },
    };

    let default_timeout = Duration::from_secs(parse_optional_env(
        "OPSPILOT_COMMAND_TIMEOUT_SECS",
        settings.sandbox.command_timeout_secs,
    )?);
    let max_timeout = Duration::from_secs(parse_optional_env(
        "OPSPILOT_MAX_COMMAND_TIMEOUT_SECS",
        settings.sandbox.max_command_timeout_secs,
    )?);
    if default_timeout.is_zero() || default_timeout > max_timeout {
        return Err(ConfigError::InvalidValue {
            key: "OPSPILOT_COMMAND_TIMEOUT_SECS".to_string(),
            message: format!(
                "must be between 1 and the maximum of {}s",
                max_timeout.as_secs()
            ),
        });
    }

    Ok(SandboxConfig {
        allowed_root,
        default_timeout,
        max_timeout,
        max_output_bytes: parse_optional_env(
            "OPSPILOT_MAX_OUTPUT_BYTES",
            settings.sandbox.max_output_bytes,
        )?,
        ..SandboxConfig::default()
    })
}
