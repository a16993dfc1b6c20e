//! collab-client: terminal editing surface for a collaboratively edited document.
//!
//! Each line typed on stdin is appended to the document as a focused local
//! edit. Lines starting with `:` are commands (`:help` lists them).

use anyhow::{Context, Result};
use clap::Parser;
use collab_client::{HttpStore, WsProvider};
use collab_core::{
    Credential, DocumentStore, InMemoryStore, LocalEdit, MemoryProvider, NotificationLevel,
    ReconnectConfig, SessionConfig, SessionEvent, SessionManager, SyncProvider, UserIdentity,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collab-client")]
#[command(about = "Edit a shared document from the terminal")]
struct Args {
    /// Document to open
    #[arg(short, long)]
    document: String,

    /// Sync server WebSocket URL (in-process relay if omitted)
    #[arg(long, env = "COLLAB_SERVER")]
    server: Option<String>,

    /// Document store base URL (in-memory store if omitted)
    #[arg(long, env = "COLLAB_STORE")]
    store: Option<String>,

    /// Bearer token for the sync server and store
    #[arg(long, env = "COLLAB_TOKEN", hide_env_values = true, default_value = "")]
    token: String,

    /// Durable user id shown to collaborators
    #[arg(long, env = "COLLAB_USER_ID")]
    user_id: String,

    /// Display name shown to collaborators
    #[arg(long, env = "COLLAB_USER_NAME")]
    name: String,

    /// Quiet period before edits are saved, in milliseconds
    #[arg(long, default_value_t = 400)]
    save_debounce_ms: u64,

    /// Inactivity before the typing indicator resets, in milliseconds
    #[arg(long, default_value_t = 1500)]
    typing_timeout_ms: u64,

    /// Give up reconnecting after this many consecutive failures
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// Print session events as JSON lines
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            save_debounce: Duration::from_millis(self.save_debounce_ms),
            typing_timeout: Duration::from_millis(self.typing_timeout_ms),
            reconnect: ReconnectConfig {
                max_attempts: self.max_reconnect_attempts,
                ..Default::default()
            },
        }
    }
}

const HELP: &str = "\
:text            print the document
:who             list collaborators
:status          show connection and save status
:save            save now
:retry           retry a failed save
:cursor A [B]    publish cursor/selection at offsets A..B
:replace TEXT    replace the whole document
:quit            close the document and exit
anything else    append the line to the document";

/// What a line of input asks for.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Text,
    Who,
    Status,
    Save,
    Retry,
    Cursor(usize, usize),
    Replace(String),
    Append(String),
    Help,
    Quit,
}

fn parse_command(line: &str) -> Result<Command> {
    let Some(rest) = line.strip_prefix(':') else {
        return Ok(Command::Append(format!("{}\n", line)));
    };
    let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
    let arg = arg.trim();

    Ok(match name {
        "text" => Command::Text,
        "who" => Command::Who,
        "status" => Command::Status,
        "save" => Command::Save,
        "retry" => Command::Retry,
        "replace" => Command::Replace(arg.to_string()),
        "help" => Command::Help,
        "q" | "quit" => Command::Quit,
        "cursor" => {
            let mut offsets = arg.split_whitespace().map(str::parse::<usize>);
            let anchor = offsets
                .next()
                .context("Usage: :cursor A [B]")?
                .context("Cursor offset must be a number")?;
            let head = offsets
                .next()
                .transpose()
                .context("Cursor offset must be a number")?
                .unwrap_or(anchor);
            Command::Cursor(anchor, head)
        }
        other => anyhow::bail!("Unknown command :{} (try :help)", other),
    })
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::PhaseChanged { phase, .. } => println!("[session] {:?}", phase),
        SessionEvent::ConnectionChanged { status, .. } => println!("[connection] {:?}", status),
        SessionEvent::SaveStatusChanged { status, .. } => println!("[save] {:?}", status),
        SessionEvent::PresenceChanged { active, typing, .. } => {
            if typing.is_empty() {
                println!("[presence] {}", active.join(", "));
            } else {
                println!(
                    "[presence] {} ({} typing)",
                    active.join(", "),
                    typing.join(", ")
                );
            }
        }
        SessionEvent::Notification { level, message, .. } => match level {
            NotificationLevel::Info => println!("[info] {}", message),
            NotificationLevel::Warning => println!("[warning] {}", message),
            NotificationLevel::Error => println!("[error] {}", message),
        },
    }
}

/// Run one command. Returns false when the user asked to quit.
async fn run_command(manager: &SessionManager, command: Command) -> Result<bool> {
    match command {
        Command::Text => println!("{}", manager.text()?),
        Command::Who => {
            let snapshot = manager.presence_snapshot();
            for entry in snapshot.entries {
                let marker = if entry.is_local { " (you)" } else { "" };
                let typing = if entry.state.typing { " typing" } else { "" };
                println!("{} <{}>{}{}", entry.state.name, entry.state.user_id, marker, typing);
            }
        }
        Command::Status => {
            println!("phase:      {:?}", manager.phase());
            println!("connection: {:?}", manager.connection_status());
            println!("save:       {:?}", manager.save_status());
        }
        Command::Save => println!("{:?}", manager.save_now().await?),
        Command::Retry => println!("{:?}", manager.retry_save().await?),
        Command::Cursor(anchor, head) => manager.update_cursor(anchor, head)?,
        Command::Replace(text) => {
            manager.edit(LocalEdit::Replace { text }, true)?;
        }
        Command::Append(text) => {
            let index = manager.text()?.chars().count();
            manager.edit(LocalEdit::Insert { index, text }, true)?;
        }
        Command::Help => println!("{}", HELP),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,collab_core=debug,collab_client=debug"
    } else {
        "info,collab_core=info,collab_client=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting collab-client");
    info!("Document: {}", args.document);

    let credential = Credential::new(args.token.clone());

    let provider: Arc<dyn SyncProvider> = match &args.server {
        Some(url) => {
            info!("Sync server: {}", url);
            Arc::new(WsProvider::new(url.clone()))
        }
        None => {
            warn!("No sync server configured, using an in-process relay");
            Arc::new(MemoryProvider::new())
        }
    };

    let store: Arc<dyn DocumentStore> = match &args.store {
        Some(url) => {
            info!("Document store: {}", url);
            let token = (!args.token.is_empty()).then(|| credential.clone());
            Arc::new(HttpStore::new(url, token)?)
        }
        None => {
            warn!("No document store configured, saves are kept in memory");
            Arc::new(InMemoryStore::new())
        }
    };

    let manager = SessionManager::new(provider, store, args.session_config())?;
    let _events = if args.json {
        manager.subscribe(|event| match serde_json::to_string(&event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!("Failed to encode event: {}", e),
        })
    } else {
        manager.subscribe(print_event)
    };

    let identity = UserIdentity::new(args.user_id.clone(), args.name.clone());
    manager.open(&args.document, credential, identity).await?;
    println!("Editing {}. Type :help for commands.", args.document);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let command = match parse_command(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                match run_command(&manager, command).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => error!("{:#}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    manager.close().await;
    Ok(())
}
