//! OpsPilot - main entry point.

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use opspilot::cli::{Cli, Command, run_agent, run_config_command, run_sessions_command};
use opspilot::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = Config::from_env_with(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    match &cli.command {
        Some(Command::Config(cmd)) => run_config_command(cmd, &config),
        Some(Command::Sessions { limit, delete }) => {
            run_sessions_command(&config, *limit, delete.as_deref()).await
        }
        None | Some(Command::Run) => run_agent(&cli, config).await,
    }
}

/// Logs go to stderr so they never interleave with answers on stdout.
fn init_tracing(json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opspilot=info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
