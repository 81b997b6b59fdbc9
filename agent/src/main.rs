//! Local coding agent with verified edits.
//!
//! `agent chat` runs the decision loop against the current directory; every
//! successful edit is checked, tested and reviewed before the model continues.
//! Sessions persist under `.agent/sessions/` and can be replayed with
//! `agent history`.

use std::io::{self, BufRead, Write};
use std::path::Path;

use agent::core::types::ToolResult;
use agent::exit_codes;
use agent::io::config::{AgentConfig, load_effective_config};
use agent::io::init::{AgentPaths, InitOptions, init_agent};
use agent::io::model::OpenAiClient;
use agent::io::process::{CancelToken, ProcessLauncher};
use agent::io::session_store::{FileSessionStore, SessionStore};
use agent::logging;
use agent::orchestrator::{LoopEvent, LoopOutcome, LoopStop, Orchestrator};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use signal_hook::consts::SIGINT;
use signal_hook::flag;

#[derive(Parser)]
#[command(
    name = "agent",
    version,
    about = "Local coding agent with verified edits"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.agent/config.toml` and the sessions directory.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one prompt, or read prompts from stdin until `/exit`.
    Chat {
        /// Session id; turns persist across invocations.
        #[arg(short, long, default_value = "default")]
        session: String,
        /// Run a single request and exit with its outcome code.
        #[arg(short, long)]
        prompt: Option<String>,
    },
    /// Print the persisted turns of a session.
    History {
        #[arg(short, long, default_value = "default")]
        session: String,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Chat { session, prompt } => cmd_chat(&root, &session, prompt.as_deref()),
        Command::History { session } => cmd_history(&root, &session),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_agent(root, &InitOptions { force })?;
    println!("initialized {}", paths.config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_chat(root: &Path, session_id: &str, prompt: Option<&str>) -> Result<i32> {
    let paths = AgentPaths::new(root);
    let cfg = load_effective_config(&paths.config_path)?;
    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel)?;

    let model = build_model(&cfg)?;
    let launcher = ProcessLauncher;
    let store = FileSessionStore::new(paths.sessions_dir.clone());
    let orchestrator = Orchestrator::new(&cfg, root, &model, &launcher, &store, cancel.clone())?;
    let mut session = orchestrator.open_session(session_id)?;

    if let Some(prompt) = prompt {
        let outcome = orchestrator.run_turn(&mut session, prompt, print_event);
        report_outcome(&outcome);
        orchestrator.end_session(session);
        return Ok(exit_code(&outcome.stop));
    }

    println!(
        "session `{}` ({} turns). /reset clears it, /exit quits.",
        session.id,
        session.turns.len()
    );
    let stdin = io::stdin();
    let mut code = exit_codes::OK;
    loop {
        print!("> ");
        io::stdout().flush().context("flush stdout")?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).context("read stdin")? == 0 {
            break;
        }
        match line.trim() {
            "" => continue,
            "/exit" => break,
            "/reset" => {
                orchestrator.reset_session(&mut session)?;
                println!("session `{}` cleared", session.id);
            }
            input => {
                cancel.reset();
                let outcome = orchestrator.run_turn(&mut session, input, print_event);
                report_outcome(&outcome);
                if matches!(outcome.stop, LoopStop::FatalError(_)) {
                    code = exit_codes::FATAL;
                    break;
                }
            }
        }
    }
    orchestrator.end_session(session);
    Ok(code)
}

fn cmd_history(root: &Path, session_id: &str) -> Result<i32> {
    let paths = AgentPaths::new(root);
    let store = FileSessionStore::new(paths.sessions_dir.clone());
    for turn in store.load(session_id)? {
        println!(
            "#{} [{}] {}: {}",
            turn.seq,
            turn.timestamp,
            turn.role.as_str(),
            turn.content.render()
        );
    }
    Ok(exit_codes::OK)
}

fn build_model(cfg: &AgentConfig) -> Result<OpenAiClient> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty());
    OpenAiClient::new(&cfg.api_base, api_key, cfg.model_timeout())
}

/// First Ctrl-C cancels the running request; a second one exits.
fn install_interrupt_handler(cancel: &CancelToken) -> Result<()> {
    let flag_ref = cancel.flag();
    flag::register_conditional_shutdown(SIGINT, exit_codes::CANCELLED, flag_ref.clone())
        .context("register SIGINT shutdown")?;
    flag::register(SIGINT, flag_ref).context("register SIGINT handler")?;
    Ok(())
}

fn print_event(event: &LoopEvent<'_>) {
    match event {
        LoopEvent::DecisionRetry {
            attempt,
            violations,
        } => println!(
            "  [retry {attempt}] malformed decision: {}",
            violations.join("; ")
        ),
        LoopEvent::ToolStep { step, tool, result } => {
            println!("  [step {step}] {tool}: {}", describe_result(result));
        }
        LoopEvent::PhaseChanged { step, phase } => {
            println!("  [step {step}] entering {phase:?} phase: read-only tools only, finalizing");
        }
    }
}

fn describe_result(result: &ToolResult) -> String {
    if !result.ok {
        let kind = result.error.map_or("error", |kind| kind.as_str());
        return format!("{kind}: {}", result.output.as_str().unwrap_or_default());
    }
    match &result.verification {
        Some(verdict) => format!(
            "ok; checks {}, review {}, edit {}",
            if verdict.report.overall { "passed" } else { "failed" },
            verdict.review.verdict,
            if verdict.edit_accepted { "accepted" } else { "not accepted" }
        ),
        None => "ok".to_string(),
    }
}

fn report_outcome(outcome: &LoopOutcome) {
    match &outcome.stop {
        LoopStop::Success { message } => println!("{message}"),
        LoopStop::BudgetExhausted { summary } => println!("{summary}"),
        LoopStop::FatalError(err) => eprintln!("fatal: {err}"),
        LoopStop::Cancelled => eprintln!("cancelled after {} steps", outcome.steps),
    }
}

fn exit_code(stop: &LoopStop) -> i32 {
    match stop {
        LoopStop::Success { .. } => exit_codes::OK,
        LoopStop::BudgetExhausted { .. } => exit_codes::BUDGET_EXHAUSTED,
        LoopStop::FatalError(_) => exit_codes::FATAL,
        LoopStop::Cancelled => exit_codes::CANCELLED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["agent", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_chat_defaults_to_interactive_default_session() {
        let cli = Cli::parse_from(["agent", "chat"]);
        match cli.command {
            Command::Chat { session, prompt } => {
                assert_eq!(session, "default");
                assert!(prompt.is_none());
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn parse_chat_one_shot() {
        let cli = Cli::parse_from(["agent", "chat", "--session", "s1", "--prompt", "fix it"]);
        match cli.command {
            Command::Chat { session, prompt } => {
                assert_eq!(session, "s1");
                assert_eq!(prompt.as_deref(), Some("fix it"));
            }
            _ => panic!("expected chat"),
        }
    }

    #[test]
    fn outcomes_map_to_exit_codes() {
        assert_eq!(exit_code(&LoopStop::Cancelled), exit_codes::CANCELLED);
        assert_eq!(
            exit_code(&LoopStop::BudgetExhausted {
                summary: String::new()
            }),
            exit_codes::BUDGET_EXHAUSTED
        );
    }
}
