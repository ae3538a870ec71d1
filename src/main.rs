use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use lens_companion::config::AppConfig;
use lens_companion::events::parse_event_block;
use lens_companion::runtime::{LocalServerRuntime, SummaryPrompt};
use lens_companion::server::{self, AppState};
use lens_companion::storage::{ScreenshotRepository, SessionRepository};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "lens-companion")]
#[command(about = "On-device vision chat: sessions, screenshots and model runtime", long_about = None)]
struct Cli {
    /// Overrides LENS_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the local bridge the app shell talks to
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
        #[arg(long)]
        metrics_listen: Option<String>,
    },
    /// Send one message, optionally continuing a session
    Chat {
        #[arg(long)]
        session: Option<String>,
        #[arg(long = "image")]
        images: Vec<String>,
        #[arg(default_value = "")]
        message: String,
    },
    /// List chat history, pinned first
    Sessions {
        /// Only sessions whose title or last message contains this text
        #[arg(long, short)]
        query: Option<String>,
    },
    Show {
        id: String,
    },
    Pin {
        id: String,
    },
    Delete {
        ids: Vec<String>,
    },
    Screenshots,
    /// Summarize the newest gallery photo now
    Capture,
    /// Summarize a single image file without storing it
    Summarize {
        path: String,
        #[arg(long)]
        events: bool,
    },
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = AppConfig::from_env();
    if cli.database_url.is_some() {
        cfg.database_url = cli.database_url;
    }
    let runtime = Arc::new(LocalServerRuntime::from_config(&cfg));
    let state = AppState::build(&cfg, runtime).await?;

    match cli.command {
        Commands::Serve { listen, metrics_listen } => {
            if let Some(m) = metrics_listen {
                let addr: SocketAddr = m.parse()?;
                metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr).install()?;
            }
            let addr: SocketAddr = listen.parse()?;
            let prefetch = state.gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = prefetch.ensure_ready().await {
                    tracing::warn!(error = %e, "model prefetch failed");
                }
            });
            server::serve(addr, state).await?;
        }
        Commands::Chat { session, images, message } => {
            let turn = state.chat.send(session.as_deref(), &message, images).await?;
            print_json(&turn)?;
        }
        Commands::Sessions { query } => {
            let sessions = match query {
                Some(q) => state.store.search_sessions(&q).await,
                None => state.store.list_sessions().await,
            };
            print_json(&sessions)?;
        }
        Commands::Show { id } => match state.store.get_session(&id).await {
            Some(s) => print_json(&s)?,
            None => anyhow::bail!("no session {id}"),
        },
        Commands::Pin { id } => state.writer.toggle_pin(&id).await,
        Commands::Delete { ids } => {
            let ids: HashSet<String> = ids.into_iter().collect();
            state.writer.delete(&ids).await;
        }
        Commands::Screenshots => print_json(&state.store.list_screenshots().await)?,
        Commands::Capture => match state.capture.process_latest().await {
            Some(entry) => {
                print_json(&entry)?;
                if let Some(ev) = parse_event_block(&entry.summary) {
                    print_json(&ev)?;
                }
            }
            None => anyhow::bail!("nothing captured"),
        },
        Commands::Summarize { path, events } => {
            let prompt = if events { SummaryPrompt::DetectEvent } else { SummaryPrompt::Describe };
            println!("{}", state.gateway.summarize_image(&path, prompt).await);
        }
    }
    Ok(())
}
