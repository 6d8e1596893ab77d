use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use oxidized_causal::display::StdoutSink;
use oxidized_causal::executor;
use oxidized_causal::models::WorkflowSession;
use oxidized_causal::session::{Orchestrator, SessionRegistry};
use oxidized_causal::{config::Config, create_router, AppState};

#[derive(Parser)]
#[command(name = "oxidized-causal")]
#[command(about = "LLM-guided causal analysis workflow")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (default)
    Serve,
    /// Run a single interactive session on stdin/stdout
    Chat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let chat = matches!(cli.command, Some(Command::Chat));

    // Chat mode keeps the terminal for the conversation
    let default_filter = if chat {
        "oxidized_causal=warn"
    } else {
        "oxidized_causal=debug,tower_http=debug,axum=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Chat => chat_loop(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    info!("Configuration loaded: {:?}", config.server);

    let orchestrator = Arc::new(Orchestrator::from_config(&config));
    let registry = SessionRegistry::new(orchestrator, &config);
    let state = AppState {
        config: config.clone(),
        registry,
    };

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}

async fn chat_loop(config: Config) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::from_config(&config);
    let executor = executor::from_config(&config.executor).await;
    let mut session = WorkflowSession::new(Uuid::new_v4());

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(b"Causal analysis session. Type 'quit' to leave.\n")
        .await?;
    loop {
        stdout
            .write_all(format!("[{}] > ", session.current_stage).as_bytes())
            .await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }

        orchestrator
            .process_message(&mut session, line, executor.as_deref(), &StdoutSink)
            .await;
    }

    if let Some(executor) = executor {
        executor.disconnect().await?;
    }
    Ok(())
}
