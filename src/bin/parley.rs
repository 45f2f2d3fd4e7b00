//! Console front end for parley.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use parley::adapters::scripted::{ScriptedChat, ScriptedFactory};
use parley::{ConversationConfig, ConversationOrchestrator, ParticipantInfo, Trigger};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Parley: turn orchestration for spoken conversations.
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Chat with an echoing assistant, typing instead of speaking.
    Chat,

    /// Print the effective configuration.
    Config {
        /// Also write it to the configuration file.
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they do not interleave with the transcript.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let path = cli
        .config
        .clone()
        .unwrap_or_else(ConversationConfig::default_config_path);
    let config = if cli.config.is_some() || path.exists() {
        ConversationConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?
    } else {
        ConversationConfig::default()
    };

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => run_chat(config).await,
        Command::Config { save } => show_config(&config, save.then_some(path.as_path())),
    }
}

async fn run_chat(config: ConversationConfig) -> anyhow::Result<()> {
    println!("Parley v{}", env!("CARGO_PKG_VERSION"));
    let assistant_name = config.assistant.name.clone();

    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    let factory = Arc::new(
        ScriptedFactory::new(
            ParticipantInfo::human("console", "You"),
            Arc::new(ScriptedChat::echo()),
        )
        .with_text_output(Some(reply_tx)),
    );
    let orchestrator = ConversationOrchestrator::new(factory.clone(), config);
    let session_id = orchestrator.start_new_session().await?;
    let input = factory
        .session(session_id)
        .map(|session| session.input)
        .context("session was built without an input")?;
    input.wait_listening().await;

    println!(
        "\nReady! Type a message and press Enter. /pause and /resume toggle listening. \
         Ctrl+D or Ctrl+C to quit.\n"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    info!("received Ctrl+C, shutting down...");
                }
                break;
            }
            reply = replies.recv() => match reply {
                Some(text) => println!("{assistant_name}: {text}"),
                None => break,
            },
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let line = line.trim();
                match line {
                    "" => {}
                    "/pause" | "/resume" => {
                        let Some(session) = orchestrator.session(session_id) else {
                            break;
                        };
                        let trigger = if line == "/pause" {
                            Trigger::PauseRequested
                        } else {
                            Trigger::ResumeRequested
                        };
                        let state = session.state();
                        if !state.accepts(trigger) {
                            println!("(cannot {} while {state:?})", &line[1..]);
                            continue;
                        }
                        let outcome = if line == "/pause" {
                            session.pause().await
                        } else {
                            session.resume().await
                        };
                        info!("{line}: {outcome:?}");
                    }
                    text => {
                        if let Err(e) = input.recognized(text) {
                            warn!("message not sent: {e}");
                        }
                    }
                }
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}

fn show_config(config: &ConversationConfig, save_to: Option<&std::path::Path>) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    if let Some(path) = save_to {
        config.save_to_file(path)?;
        eprintln!("saved to {}", path.display());
    }
    Ok(())
}
