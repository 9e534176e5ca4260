//! Run Claude Code in a sandbox from the command line.
//!
//! One-shot: `sandbox-agents -p "list the files here"`
//!
//! Interactive: `sandbox-agents` then type messages; `quit` exits.

use std::{
    io::Write,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use futures::TryStreamExt;
use sandbox_agents_core::{
    AgentConfig, EventKind, SandboxProvider,
    config::{DEFAULT_API_KEY_ENV, DEFAULT_BINARY, DEFAULT_SNAPSHOT},
};
use sandbox_agents_local::LocalProvider;
use sandbox_agents_session::{Session, StreamOptions, create_session_for_agent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "sandbox-agents")]
#[command(about = "Run Claude Code in a sandbox")]
struct Args {
    /// Run a single prompt and exit (non-interactive mode)
    #[arg(short, long, value_name = "TEXT")]
    prompt: Option<String>,

    /// Custom instructions appended to the agent's system prompt
    #[arg(long, value_name = "TEXT")]
    instructions: Option<String>,

    /// Sandbox snapshot image
    #[arg(long, default_value = DEFAULT_SNAPSHOT)]
    snapshot: String,

    /// Directory holding local sandboxes (default: user cache dir)
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Command installing the agent in a fresh sandbox (default: none)
    #[arg(long, value_name = "COMMAND")]
    install: Option<String>,

    /// Agent binary inside the sandbox
    #[arg(long, default_value = DEFAULT_BINARY)]
    binary: String,

    /// Agent API key
    #[arg(long, env = DEFAULT_API_KEY_ENV, hide_env_values = true)]
    api_key: Option<String>,

    /// Milliseconds between output polls
    #[arg(long, default_value_t = 300)]
    poll_interval_ms: u64,

    /// Give up on a turn after this many seconds
    #[arg(long, value_name = "SECS")]
    deadline_secs: Option<u64>,
}

impl Args {
    fn config(&self) -> AgentConfig {
        AgentConfig {
            api_key: self.api_key.clone(),
            snapshot: self.snapshot.clone(),
            binary: self.binary.clone(),
            install_command: self.install.clone(),
            ..AgentConfig::default()
        }
    }

    fn stream_options(&self) -> StreamOptions {
        let mut options =
            StreamOptions::default().poll_interval(Duration::from_millis(self.poll_interval_ms));
        if let Some(instructions) = &self.instructions {
            options = options.instructions(instructions.clone());
        }
        if let Some(secs) = self.deadline_secs {
            options = options.deadline(Duration::from_secs(secs));
        }
        options
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let provider: Arc<dyn SandboxProvider> = Arc::new(match &args.root {
        Some(root) => LocalProvider::new(root),
        None => LocalProvider::with_default_root(),
    });

    eprintln!("Creating sandbox...");
    let session = create_session_for_agent(provider, args.config())
        .await
        .context("failed to create sandbox session")?;
    eprintln!("Sandbox ready.\n");

    let outcome = tokio::select! {
        result = run(&session, &args) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            Ok(())
        }
    };

    eprintln!("Deleting sandbox...");
    session.close().await.context("failed to delete sandbox")?;
    eprintln!("Done.");
    outcome
}

async fn run(session: &Session, args: &Args) -> anyhow::Result<()> {
    let options = args.stream_options();

    if let Some(prompt) = &args.prompt {
        return print_turn(session, prompt, options).await;
    }

    println!("Type a message to send to the agent. Type 'quit' to exit.\n");
    let mut reader = BufReader::new(tokio::io::stdin()).lines();
    let mut first_turn = true;

    loop {
        print!("You: ");
        std::io::stdout().flush()?;

        let line = match reader.next_line().await? {
            None => {
                println!();
                break;
            }
            Some(s) if s.trim().is_empty() => continue,
            Some(s) if s.trim().eq_ignore_ascii_case("quit") => break,
            Some(s) => s,
        };

        print!("Agent: ");
        let turn_options = options.clone().continue_conversation(!first_turn);
        match print_turn(session, line.trim(), turn_options).await {
            Ok(()) => first_turn = false,
            Err(e) => eprintln!("\nError: {e:#}"),
        }
        println!();
    }
    Ok(())
}

/// Stream one turn, printing text as it arrives.
async fn print_turn(session: &Session, prompt: &str, options: StreamOptions) -> anyhow::Result<()> {
    let mut events = session.stream(prompt, options).await?;
    let mut stdout = std::io::stdout();

    while let Some(event) = events.try_next().await? {
        match event.kind() {
            EventKind::Text => {
                write!(stdout, "{}", event.content())?;
                stdout.flush()?;
            }
            EventKind::Stderr => {
                tracing::warn!(stderr = %event.content().trim(), "agent wrote to stderr");
            }
            kind => tracing::debug!(%kind, "event"),
        }
    }
    writeln!(stdout)?;
    Ok(())
}
