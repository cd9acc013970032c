//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the assistant (`run`, the default): interactive REPL, or a
//!   single message with `--message`
//! - Listing stored sessions (`sessions`)
//! - Showing configuration (`config show`, `config path`)

mod config;
mod repl;

pub use config::{ConfigCommand, mask_secret, run_config_command};
pub use repl::{
    ReplCommand, TerminalConfirmer, build_orchestrator, parse_command, run_agent,
    run_sessions_command,
};

use std::path::PathBuf;

use clap::{ColorChoice, Parser, Subcommand};

use crate::agent::Mode;
use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "opspilot")]
#[command(about = "Terminal DevOps assistant with a plan mode and a safety-gated build mode")]
#[command(
    long_about = "OpsPilot inspects your system in plan mode and executes changes in build mode, \
    asking before anything risky.\nExamples:\n  opspilot  # Start the REPL in plan mode\n  \
    opspilot --mode build -m 'restart nginx'  # One-shot request"
)]
#[command(version)]
#[command(color = ColorChoice::Auto)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Initial mode (plan or build)
    #[arg(long, global = true)]
    pub mode: Option<Mode>,

    /// Resume or create a named session
    #[arg(short, long, global = true)]
    pub session: Option<String>,

    /// Single message mode - send one message and exit
    #[arg(short, long, global = true)]
    pub message: Option<String>,

    /// Workspace root for file tools and commands
    #[arg(short, long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Settings file path (defaults to ~/.opspilot/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the assistant (default if no subcommand given)
    Run,

    /// List stored sessions, most recent first
    Sessions {
        /// Maximum number of sessions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Delete the session with this id instead of listing
        #[arg(short, long, value_name = "ID")]
        delete: Option<String>,
    },

    /// Show configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Check if we should run the assistant (default behavior or explicit `run` command).
    pub fn should_run_agent(&self) -> bool {
        matches!(self.command, None | Some(Command::Run))
    }

    /// Apply flags on top of the resolved configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.agent.initial_mode = mode;
        }
        if let Some(workspace) = &self.workspace {
            config.sandbox.allowed_root = workspace.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_version() {
        let cmd = Cli::command();
        assert_eq!(
            cmd.get_version().unwrap_or("unknown"),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "opspilot",
            "--mode",
            "build",
            "--session",
            "incident-7",
            "-m",
            "check disk",
        ])
        .unwrap();
        assert_eq!(cli.mode, Some(Mode::Build));
        assert_eq!(cli.session.as_deref(), Some("incident-7"));
        assert_eq!(cli.message.as_deref(), Some("check disk"));
        assert!(cli.should_run_agent());
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!(Cli::try_parse_from(["opspilot", "--mode", "deploy"]).is_err());
    }

    #[test]
    fn test_subcommands() {
        let cli = Cli::try_parse_from(["opspilot", "sessions", "--limit", "5"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Sessions {
                limit: 5,
                delete: None
            })
        ));
        assert!(!cli.should_run_agent());

        let cli = Cli::try_parse_from(["opspilot", "sessions", "--delete", "old-run"]).unwrap();
        match cli.command {
            Some(Command::Sessions { limit, delete }) => {
                assert_eq!(limit, 20);
                assert_eq!(delete.as_deref(), Some("old-run"));
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::try_parse_from(["opspilot", "config", "path"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Config(ConfigCommand::Path))));
    }
}
