use std::time::Duration;

use secrecy::SecretString;

use crate::agent::Mode;
use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;
use crate::settings::Settings;

/// Built-in endpoint and per-mode model choices for a provider name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub plan_model: &'static str,
    pub build_model: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        plan_model: "gpt-4o",
        build_model: "gpt-4o-mini",
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        plan_model: "openai/gpt-4o",
        build_model: "openai/gpt-4o-mini",
    },
    ProviderPreset {
        name: "anthropic",
        base_url: "https://api.anthropic.com/v1",
        plan_model: "claude-sonnet-4-5",
        build_model: "claude-opus-4-1",
    },
    ProviderPreset {
        name: "zhipu",
        base_url: "https://openrouter.ai/api/v1",
        plan_model: "z-ai/glm-4.6",
        build_model: "z-ai/glm-4.6",
    },
];

impl ProviderPreset {
    pub fn find(name: &str) -> Option<&'static ProviderPreset> {
        PRESETS.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        PRESETS.iter().map(|p| p.name)
    }
}

/// Model provider configuration.
#[derive(Clone)]
pub struct LlmConfig {
    pub provider: String,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub plan_model: String,
    pub build_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.is_some())
            .field("plan_model", &self.plan_model)
            .field("build_model", &self.build_model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl LlmConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let provider = optional_env("OPSPILOT_PROVIDER")?
            .unwrap_or_else(|| settings.llm.provider.clone())
            .to_ascii_lowercase();

        let preset = ProviderPreset::find(&provider).ok_or_else(|| ConfigError::InvalidValue {
            key: "OPSPILOT_PROVIDER".to_string(),
            message: format!(
                "unknown provider '{provider}', expected one of: {}",
                ProviderPreset::names().collect::<Vec<_>>().join(", ")
            ),
        })?;

        let api_key = optional_env("OPSPILOT_API_KEY")?
            .or_else(|| settings.llm.api_key.clone())
            .map(SecretString::from);

        let base_url = optional_env("OPSPILOT_BASE_URL")?
            .or_else(|| settings.llm.base_url.clone())
            .unwrap_or_else(|| preset.base_url.to_string());

        let plan_model = optional_env("OPSPILOT_PLAN_MODEL")?
            .or_else(|| settings.llm.plan_model.clone())
            .unwrap_or_else(|| preset.plan_model.to_string());
        let build_model = optional_env("OPSPILOT_BUILD_MODEL")?
            .or_else(|| settings.llm.build_model.clone())
            .unwrap_or_else(|| preset.build_model.to_string());

        let temperature = parse_optional_env("OPSPILOT_TEMPERATURE", settings.llm.temperature)?;
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ConfigError::InvalidValue {
                key: "OPSPILOT_TEMPERATURE".to_string(),
                message: format!("must be between 0.0 and 2.0, got {temperature}"),
            });
        }

        Ok(Self {
            provider: preset.name.to_string(),
            base_url,
            api_key,
            plan_model,
            build_model,
            max_tokens: parse_optional_env("OPSPILOT_MAX_TOKENS", settings.llm.max_tokens)?,
            temperature,
            request_timeout: Duration::from_secs(parse_optional_env(
                "OPSPILOT_REQUEST_TIMEOUT_SECS",
                settings.llm.request_timeout_secs,
            )?),
        })
    }

    /// Model used while the assistant is in `mode`.
    pub fn model_for(&self, mode: Mode) -> &str {
        match mode {
            Mode::Plan => &self.plan_model,
            Mode::Build => &self.build_model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::helpers::ENV_MUTEX;

    fn clear_llm_env() {
        for key in [
            "OPSPILOT_PROVIDER",
            "OPSPILOT_API_KEY",
            "OPSPILOT_BASE_URL",
            "OPSPILOT_PLAN_MODEL",
            "OPSPILOT_BUILD_MODEL",
            "OPSPILOT_TEMPERATURE",
            "OPSPILOT_MAX_TOKENS",
            "OPSPILOT_REQUEST_TIMEOUT_SECS",
        ] {
            // SAFETY: Under ENV_MUTEX.
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn preset_supplies_models_per_mode() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_llm_env();

        let mut settings = Settings::default();
        settings.llm.provider = "openrouter".to_string();
        let config = LlmConfig::resolve(&settings).expect("resolve should succeed");

        assert_eq!(config.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.model_for(Mode::Plan), "openai/gpt-4o");
        assert_eq!(config.model_for(Mode::Build), "openai/gpt-4o-mini");
        assert_eq!(config.max_tokens, 4000);
    }

    #[test]
    fn env_overrides_settings() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_llm_env();

        // SAFETY: Under ENV_MUTEX.
        unsafe {
            std::env::set_var("OPSPILOT_BUILD_MODEL", "local-coder");
            std::env::set_var("OPSPILOT_API_KEY", "sk-test");
        }

        let config = LlmConfig::resolve(&Settings::default()).expect("resolve should succeed");
        assert_eq!(config.model_for(Mode::Build), "local-coder");
        assert_eq!(config.model_for(Mode::Plan), "gpt-4o");
        assert!(config.api_key.is_some());
        assert!(!format!("{config:?}").contains("sk-test"));

        clear_llm_env();
    }

    #[test]
    fn unknown_provider_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_llm_env();

        let mut settings = Settings::default();
        settings.llm.provider = "carrier-pigeon".to_string();
        let err = LlmConfig::resolve(&settings).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn temperature_out_of_range_rejected() {
        let _guard = ENV_MUTEX.lock().expect("env mutex poisoned");
        clear_llm_env();

        let mut settings = Settings::default();
        settings.llm.temperature = 3.5;
        assert!(LlmConfig::resolve(&settings).is_err());
    }
}
