//! Interactive terminal front end.
//!
//! Wires configuration into an [`Orchestrator`], then either answers a single
//! message or runs a `rustyline` REPL. Ctrl-C during a turn cancels that
//! turn; at the prompt it just clears the line.

use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::Stylize;
use crossterm::terminal;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    Confirmer, Mode, Orchestrator, StatusReceiver, StatusUpdate, ToolDispatcher, TurnOutcome,
    status_channel,
};
use crate::cli::Cli;
use crate::config::Config;
use crate::history::{JsonlStore, TranscriptStore, new_session_id};
use crate::llm::create_provider;
use crate::safety::{RuleTable, SafetyClassifier};
use crate::sandbox::ExecutionSandbox;
use crate::settings::opspilot_dir;
use crate::tools::ToolRegistry;

/// Asks for confirmation on the terminal with a `[y/N]` prompt.
///
/// On a tty the answer is a single key read in raw mode, polled so that a
/// cancelled turn releases the terminal before the next REPL prompt. Piped
/// stdin falls back to reading one line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, description: &str) -> bool {
        let stop = Arc::new(AtomicBool::new(false));
        let _guard = StopOnDrop(Arc::clone(&stop));
        let description = description.to_string();
        tokio::task::spawn_blocking(move || ask_yes_no(&description, &stop))
            .await
            .unwrap_or(false)
    }
}

/// Raises the flag when the confirmation future is dropped.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn ask_yes_no(description: &str, stop: &AtomicBool) -> bool {
    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "{} {}", "Confirm:".yellow().bold(), description);
    let _ = write!(stderr, "Proceed? [y/N] ");
    let _ = stderr.flush();

    if !std::io::stdin().is_terminal() {
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        return matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes");
    }

    if let Err(e) = terminal::enable_raw_mode() {
        tracing::warn!(error = %e, "Could not read a key from the terminal; declining");
        let _ = writeln!(stderr);
        return false;
    }
    let answer = read_answer_key(stop);
    let _ = terminal::disable_raw_mode();

    let echo = match answer {
        Some(true) => "yes",
        Some(false) => "no",
        None => "cancelled",
    };
    let _ = writeln!(stderr, "{}", echo);
    answer.unwrap_or(false)
}

/// `None` when `stop` was raised before an answer arrived.
fn read_answer_key(stop: &AtomicBool) -> Option<bool> {
    while !stop.load(Ordering::Relaxed) {
        match event::poll(KEY_POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(_) => return Some(false),
        }
        match event::read() {
            Ok(Event::Key(key)) => {
                if let Some(answer) = key_answer(&key) {
                    return Some(answer);
                }
            }
            Ok(_) => {}
            Err(_) => return Some(false),
        }
    }
    None
}

/// Map a key press to an answer. Anything but `y` that means "done" declines.
fn key_answer(key: &KeyEvent) -> Option<bool> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c' | 'd') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(false),
        KeyCode::Char('y' | 'Y') => Some(true),
        KeyCode::Char('n' | 'N') | KeyCode::Enter | KeyCode::Esc => Some(false),
        _ => None,
    }
}

/// Build an orchestrator from resolved configuration.
///
/// When history is enabled the transcript for `session` (or a fresh id) is
/// loaded and every new turn is appended to it.
pub async fn build_orchestrator(
    config: &Config,
    session: Option<&str>,
) -> anyhow::Result<Orchestrator> {
    let rules = match &config.safety.rules_file {
        Some(path) => RuleTable::load(path)?,
        None => RuleTable::default(),
    };

    let sandbox = Arc::new(ExecutionSandbox::new(config.sandbox.clone())?);
    let classifier = SafetyClassifier::new(rules).with_workspace(sandbox.root());
    let mut registry = ToolRegistry::new();
    registry.register_builtin_tools(sandbox)?;
    let dispatcher = ToolDispatcher::new(Arc::new(registry), classifier);

    let llm = create_provider(&config.llm)?;
    let mut agent =
        Orchestrator::new(llm, dispatcher, config.agent.clone()).with_llm_config(&config.llm);

    if config.history.enabled {
        let store: Arc<dyn TranscriptStore> = Arc::new(JsonlStore::new(&config.history.dir));
        let session_id = session.map(str::to_string).unwrap_or_else(new_session_id);
        if let Err(e) = store
            .prune(config.history.max_sessions, Some(&session_id))
            .await
        {
            tracing::warn!(error = %e, "Failed to prune old sessions");
        }
        agent.attach_store(store, session_id).await?;
    } else if session.is_some() {
        tracing::warn!("History is disabled; --session is ignored");
    }

    Ok(agent)
}

/// Run the assistant: one message if `--message` was given, otherwise the REPL.
pub async fn run_agent(cli: &Cli, config: Config) -> anyhow::Result<()> {
    let (tx, rx) = status_channel();
    let agent = build_orchestrator(&config, cli.session.as_deref())
        .await?
        .with_status(tx);
    let printer = tokio::spawn(print_status(rx));

    let result = match &cli.message {
        Some(message) => run_once(agent, message).await,
        None => run_repl(agent).await,
    };
    printer.abort();
    result
}

/// List stored sessions, or delete one when `delete` names it.
pub async fn run_sessions_command(
    config: &Config,
    limit: usize,
    delete: Option<&str>,
) -> anyhow::Result<()> {
    let store = JsonlStore::new(&config.history.dir);
    if let Some(id) = delete {
        if store.delete(id).await? {
            println!("Deleted session {}", id);
        } else {
            println!("No session {} in {}", id, store.dir().display());
        }
        return Ok(());
    }
    let sessions = store.list_sessions().await?;
    if sessions.is_empty() {
        println!("No sessions in {}", store.dir().display());
        return Ok(());
    }
    for session in sessions.into_iter().take(limit) {
        let updated = session
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<38} {:>6} turns  {}", session.id, session.turns, updated);
    }
    Ok(())
}

async fn run_once(mut agent: Orchestrator, message: &str) -> anyhow::Result<()> {
    match run_turn(&mut agent, message).await {
        TurnOutcome::Complete { .. } => Ok(()),
        TurnOutcome::Failed { error } => Err(error.into()),
        TurnOutcome::Cancelled => anyhow::bail!("turn cancelled"),
    }
}

/// Submit one message with Ctrl-C wired to cancellation, printing the outcome.
async fn run_turn(agent: &mut Orchestrator, text: &str) -> TurnOutcome {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let outcome = agent.submit(text, &TerminalConfirmer, &cancel).await;
    interrupt.abort();

    match &outcome {
        TurnOutcome::Complete { response } => println!("\n{}\n", response),
        TurnOutcome::Failed { error } => {
            eprintln!("{} {}", "Turn failed:".red().bold(), error);
        }
        TurnOutcome::Cancelled => eprintln!("{}", "Turn cancelled.".yellow()),
    }
    outcome
}

/// A slash command typed at the REPL prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCommand {
    SetMode(Mode),
    ShowMode,
    ToggleMode,
    NewSession,
    Tools,
    Summary,
    Help,
    Quit,
}

/// Parse a `/command`; `None` means the line is a message for the model.
pub fn parse_command(input: &str) -> Option<Result<ReplCommand, String>> {
    let rest = input.trim().strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next();

    Some(match (name.as_str(), arg) {
        ("plan", None) => Ok(ReplCommand::SetMode(Mode::Plan)),
        ("build", None) => Ok(ReplCommand::SetMode(Mode::Build)),
        ("mode", None) => Ok(ReplCommand::ShowMode),
        ("mode", Some(m)) => m.parse().map(ReplCommand::SetMode),
        ("toggle", None) => Ok(ReplCommand::ToggleMode),
        ("clear" | "new", None) => Ok(ReplCommand::NewSession),
        ("tools", None) => Ok(ReplCommand::Tools),
        ("summary", None) => Ok(ReplCommand::Summary),
        ("help", None) => Ok(ReplCommand::Help),
        ("quit" | "exit", None) => Ok(ReplCommand::Quit),
        _ => Err(format!("unknown command '{}', try /help", input.trim())),
    })
}

const HELP: &str = "\
/plan            switch to plan mode (read-only)
/build           switch to build mode (changes need the safety gate)
/mode [m]        show or set the mode
/toggle          switch between plan and build
/clear, /new     start a fresh session (the old one stays on disk)
/tools           list tools available in the current mode
/summary         show session details
/quit            exit";

async fn run_repl(mut agent: Orchestrator) -> anyhow::Result<()> {
    let summary = agent.conversation_summary();
    println!(
        "{} session {} ({} mode, {}). Type /help for commands.",
        "OpsPilot".bold(),
        summary.session_id,
        summary.mode,
        summary.current_model
    );
    if summary.message_count > 0 {
        println!("Resumed {} transcript entries.", summary.message_count);
    }

    let mut editor = DefaultEditor::new()?;
    let history_path = opspilot_dir().join("repl_history");
    let _ = editor.load_history(&history_path);

    loop {
        let prompt = format!("{} > ", agent.mode());
        let line = match tokio::task::block_in_place(|| editor.readline(&prompt)) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        match parse_command(input) {
            None => {
                run_turn(&mut agent, input).await;
            }
            Some(Err(message)) => eprintln!("{}", message.red()),
            Some(Ok(ReplCommand::Quit)) => break,
            Some(Ok(command)) => handle_command(&mut agent, command),
        }
    }

    if let Some(parent) = history_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    if let Err(e) = editor.save_history(&history_path) {
        tracing::debug!(error = %e, "Could not save REPL history");
    }
    Ok(())
}

fn handle_command(agent: &mut Orchestrator, command: ReplCommand) {
    match command {
        ReplCommand::SetMode(mode) => {
            agent.set_mode(mode);
            println!("Mode: {}", mode);
        }
        ReplCommand::ShowMode => println!("Mode: {}", agent.mode()),
        ReplCommand::ToggleMode => {
            let mode = agent.mode().toggled();
            agent.set_mode(mode);
            println!("Mode: {}", mode);
        }
        ReplCommand::NewSession => {
            let id = agent.new_session();
            println!("New session {}", id);
        }
        ReplCommand::Tools => {
            for spec in agent.dispatcher().registry().schemas_for(agent.mode()) {
                let marker = if spec.mutating { "*" } else { " " };
                println!("{} {:<16} {}", marker, spec.name, spec.description);
            }
        }
        ReplCommand::Summary => {
            let s = agent.conversation_summary();
            println!("session:  {}", s.session_id);
            println!("mode:     {}", s.mode);
            println!("model:    {}", s.current_model);
            println!("entries:  {}", s.message_count);
            println!("tools:    {}", s.available_tools.join(", "));
        }
        ReplCommand::Help => println!("{}", HELP),
        ReplCommand::Quit => {}
    }
}

async fn print_status(mut rx: StatusReceiver) {
    while let Some(update) = rx.recv().await {
        match update {
            StatusUpdate::Thinking(message) => eprintln!("{}", message.dark_grey()),
            StatusUpdate::ToolStarted { name, .. } => {
                eprintln!("  {} {}", "->".cyan(), name.as_str().cyan());
            }
            StatusUpdate::ToolCompleted {
                name,
                success,
                elapsed,
                ..
            } => {
                let mark = if success { "ok".green() } else { "error".red() };
                eprintln!("  {} {} ({} ms)", mark, name, elapsed.as_millis());
            }
            StatusUpdate::ToolResult { preview, .. } => {
                if !preview.is_empty() {
                    eprintln!("     {}", preview.dark_grey());
                }
            }
            StatusUpdate::ModeChanged { to, .. } => {
                eprintln!("{}", format!("Switched to {} mode", to).yellow());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("restart nginx"), None);
        assert_eq!(
            parse_command("/plan"),
            Some(Ok(ReplCommand::SetMode(Mode::Plan)))
        );
        assert_eq!(
            parse_command(" /MODE build "),
            Some(Ok(ReplCommand::SetMode(Mode::Build)))
        );
        assert_eq!(parse_command("/mode"), Some(Ok(ReplCommand::ShowMode)));
        assert_eq!(parse_command("/exit"), Some(Ok(ReplCommand::Quit)));
        assert_eq!(parse_command("/toggle"), Some(Ok(ReplCommand::ToggleMode)));
        assert_eq!(parse_command("/clear"), Some(Ok(ReplCommand::NewSession)));
        assert_eq!(parse_command("/new"), Some(Ok(ReplCommand::NewSession)));
        assert!(matches!(parse_command("/deploy"), Some(Err(_))));
        assert!(matches!(parse_command("/mode yolo"), Some(Err(_))));
        assert!(matches!(parse_command("/clear all"), Some(Err(_))));
    }

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn test_key_answer() {
        assert_eq!(key_answer(&key(KeyCode::Char('y'), KeyModifiers::NONE)), Some(true));
        assert_eq!(key_answer(&key(KeyCode::Char('Y'), KeyModifiers::SHIFT)), Some(true));
        assert_eq!(key_answer(&key(KeyCode::Char('n'), KeyModifiers::NONE)), Some(false));
        assert_eq!(key_answer(&key(KeyCode::Enter, KeyModifiers::NONE)), Some(false));
        assert_eq!(key_answer(&key(KeyCode::Esc, KeyModifiers::NONE)), Some(false));
        assert_eq!(
            key_answer(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(false)
        );
        assert_eq!(key_answer(&key(KeyCode::Char('x'), KeyModifiers::NONE)), None);

        let mut release = key(KeyCode::Char('y'), KeyModifiers::NONE);
        release.kind = KeyEventKind::Release;
        assert_eq!(key_answer(&release), None);
    }

    #[test]
    fn test_read_answer_key_returns_once_stopped() {
        let stop = AtomicBool::new(true);
        assert_eq!(read_answer_key(&stop), None);
    }

    #[tokio::test]
    async fn test_dropped_confirmation_raises_stop_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let pending = {
            let stop = Arc::clone(&stop);
            async move {
                let _guard = StopOnDrop(stop);
                std::future::pending::<bool>().await
            }
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::select! {
            biased;
            _ = pending => unreachable!(),
            _ = cancel.cancelled() => {}
        }
        assert!(stop.load(Ordering::Relaxed));
    }
}
