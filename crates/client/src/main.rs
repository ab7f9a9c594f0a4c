//! Kheti chat client.
//!
//! Terminal front end over the chat controller: reads lines from
//! stdin, prints transcript updates and notices, and forwards route
//! changes as `/open` commands.

use std::io::BufRead;
use std::path::PathBuf;

use clap::Parser;
use console::style;
use kheti_protocol::MessageRole;
use tokio::sync::mpsc;
use tracing::info;

use kheti::audio::{AudioPipeline, FileMicrophone, Transcriber};
use kheti::auth::Credentials;
use kheti::backend::HttpBackend;
use kheti::config::{self, Config};
use kheti::controller::{self, Command, UiEvent};
use kheti::logging::init_logging;

#[derive(Parser, Debug)]
#[command(name = "kheti", about = "Chat session client", version)]
struct Cli {
    /// Chat server base URL.
    #[arg(long, env = "KHETI_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token for authenticated requests.
    #[arg(long, env = "KHETI_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Session id to open on startup.
    #[arg(long)]
    session: Option<String>,

    /// Data directory (config, logs).
    #[arg(long, env = "KHETI_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path recordings are read from when the mic stops.
    #[arg(long)]
    audio_input: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    config::init_data_dir(cli.data_dir.as_deref());
    config::ensure_dirs()?;
    let _logging = init_logging(&config::log_dir())?;

    let file_config = Config::load()?;
    let base_url = cli
        .base_url
        .or(file_config.base_url)
        .unwrap_or_else(|| "http://localhost:3000".to_string());
    let credentials = Credentials::new(cli.access_token.or(file_config.access_token));
    let viewer_id = credentials.viewer_id();

    info!(component = "main", base_url = %base_url, signed_in = viewer_id.is_some(), "starting");

    let audio = match cli.audio_input.or(file_config.audio_input) {
        Some(path) => AudioPipeline::new(Box::new(FileMicrophone::new(path)), Transcriber::Server),
        None => AudioPipeline::unavailable(),
    };

    let backend = HttpBackend::new(base_url, credentials);
    let (events_tx, events_rx) = mpsc::channel(256);
    let handle = controller::spawn(backend, audio, viewer_id, events_tx);

    tokio::spawn(print_events(events_rx));

    if let Some(session_id) = cli.session {
        handle
            .send(Command::Navigate {
                session_id: Some(session_id),
            })
            .await;
    }

    // Blocking stdin reads stay off the runtime threads.
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if line_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        let line = line.trim().to_string();
        match line.as_str() {
            "" => continue,
            "/quit" => break,
            "/new" => {
                let session_id = format!("{}{}", kheti_protocol::TEMP_SESSION_PREFIX, kheti_protocol::new_id());
                handle
                    .send(Command::Navigate {
                        session_id: Some(session_id),
                    })
                    .await;
            }
            "/clear" => handle.send(Command::Navigate { session_id: None }).await,
            "/record" => handle.send(Command::StartRecording).await,
            "/stop" => handle.send(Command::StopRecording).await,
            "/share" => handle.send(Command::SetVisibility { is_public: true }).await,
            "/unshare" => handle.send(Command::SetVisibility { is_public: false }).await,
            _ if line.starts_with("/open ") => {
                let session_id = line["/open ".len()..].trim().to_string();
                handle
                    .send(Command::Navigate {
                        session_id: Some(session_id),
                    })
                    .await;
            }
            _ => handle.send(Command::Send { text: line }).await,
        }
    }

    handle.send(Command::Shutdown).await;
    Ok(())
}

async fn print_events(mut events_rx: mpsc::Receiver<UiEvent>) {
    while let Some(event) = events_rx.recv().await {
        match event {
            UiEvent::MessageAppended(message) => {
                let label = match message.role {
                    MessageRole::User => style("you").cyan().bold(),
                    MessageRole::Assistant => style("assistant").green().bold(),
                };
                println!("{label}: {}", message.content);
            }
            UiEvent::Notice { text, error } => {
                if error {
                    eprintln!("{} {text}", style("!").red().bold());
                } else {
                    eprintln!("{} {text}", style("*").yellow());
                }
            }
            UiEvent::RouteReplaced { session_id } => {
                eprintln!("{} session: {session_id}", style("~").dim());
            }
            UiEvent::SessionListChanged { session_id, .. } => {
                info!(component = "main", session_id = %session_id, "session list changed");
            }
        }
    }
}
