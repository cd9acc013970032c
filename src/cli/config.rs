//! Configuration CLI commands.
//!
//! Shows the resolved configuration (settings file < env < flags) and where
//! the settings file lives.

use clap::Subcommand;
use secrecy::ExposeSecret;

use crate::config::Config;
use crate::settings::Settings;

#[derive(Subcommand, Debug, Clone, Default)]
pub enum ConfigCommand {
    /// Print the resolved configuration (API key masked)
    #[default]
    Show,

    /// Print the settings file path
    Path,
}

/// Run a config command against an already-resolved configuration.
pub fn run_config_command(cmd: &ConfigCommand, config: &Config) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show => print!("{}", render_config(config)),
        ConfigCommand::Path => println!("{}", Settings::default_path().display()),
    }
    Ok(())
}

/// Mask all but the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

fn render_config(config: &Config) -> String {
    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|k| mask_secret(k.expose_secret()))
        .unwrap_or_else(|| "(not set)".to_string());
    let turn_timeout = config
        .agent
        .turn_timeout
        .map(|t| format!("{}s", t.as_secs()))
        .unwrap_or_else(|| "none".to_string());
    let rules = config
        .safety
        .rules_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "built-in".to_string());

    let mut out = String::new();
    let mut line = |key: &str, value: String| {
        out.push_str(&format!("{:<24} {}\n", key, value));
    };
    line("provider", config.llm.provider.clone());
    line("base_url", config.llm.base_url.clone());
    line("api_key", api_key);
    line("plan_model", config.llm.plan_model.clone());
    line("build_model", config.llm.build_model.clone());
    line("max_tokens", config.llm.max_tokens.to_string());
    line("temperature", config.llm.temperature.to_string());
    line("mode", config.agent.initial_mode.to_string());
    line("max_iterations", config.agent.max_iterations.to_string());
    line("turn_timeout", turn_timeout);
    line("workspace", config.sandbox.allowed_root.display().to_string());
    line(
        "command_timeout",
        format!(
            "{}s (max {}s)",
            config.sandbox.default_timeout.as_secs(),
            config.sandbox.max_timeout.as_secs()
        ),
    );
    line("max_output_bytes", config.sandbox.max_output_bytes.to_string());
    line("safety_rules", rules);
    line(
        "history",
        if config.history.enabled {
            format!(
                "{} (keep {})",
                config.history.dir.display(),
                config.history.max_sessions
            )
        } else {
            "disabled".to_string()
        },
    );
    out
}
