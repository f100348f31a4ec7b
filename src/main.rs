use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, EnvFilter};

mod backend;
mod citations;
mod controller;
mod error;
mod render;
mod session;
mod settings;
mod stream;

use backend::{ChatBackend, HttpBackend};
use controller::{ChatSession, SubmitOutcome, SUGGESTED_QUERIES};
use render::{drive, TerminalRenderer};
use session::UploadRecord;
use settings::{QueryField, ResponseMode, SettingsLayer, SourceMode};

#[derive(Debug, Parser)]
#[command(name = "niti_chat")]
#[command(about = "Terminal client for the MiningNiti compliance assistant", long_about = None)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct BackendArgs {
    /// Backend base URL [env: NITI_BACKEND_URL, default: http://localhost:8000]
    #[arg(long, global = true)]
    backend_url: Option<String>,
    /// Where answers are looked up [env: NITI_SOURCE]
    #[arg(long, value_enum, global = true)]
    source: Option<SourceMode>,
    /// How the chat endpoint responds [env: NITI_RESPONSE_MODE]
    #[arg(long, value_enum, global = true)]
    response_mode: Option<ResponseMode>,
    /// JSON field carrying the question [env: NITI_QUERY_FIELD]
    #[arg(long, value_enum, global = true)]
    query_field: Option<QueryField>,
    #[arg(long, global = true)]
    connect_timeout_secs: Option<u64>,
}

impl BackendArgs {
    fn layer(&self) -> SettingsLayer {
        SettingsLayer {
            backend_url: self.backend_url.clone(),
            source: self.source,
            response_mode: self.response_mode,
            query_field: self.query_field,
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat; Ctrl-C stops the current answer.
    Chat,
    /// Ask a single question and print the answer.
    Ask { question: Vec<String> },
    /// Upload a PDF for indexing.
    Upload { path: PathBuf },
    /// Check that the backend is reachable.
    Health,
    /// List suggested questions.
    Suggest,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = settings::resolve_effective_settings(&SettingsLayer::from_env(), &cli.backend.layer())?;
    tracing::debug!(backend = %settings.backend_url, source = %settings.source, "resolved settings");
    let session = Arc::new(ChatSession::new(HttpBackend::new(&settings)?, settings.source));

    match cli.command {
        Commands::Chat => run_chat(session).await?,
        Commands::Ask { question } => {
            let cancel_on_interrupt = spawn_interrupt_handler(session.clone());
            let outcome = ask(&session, &question.join(" ")).await?;
            cancel_on_interrupt.abort();
            if !answered(&outcome)? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Upload { path } => {
            let record = session.upload(&path).await.map_err(anyhow::Error::msg)?;
            print_upload(&record);
        }
        Commands::Health => {
            let health = session.backend().health().await?;
            println!("status: {}, documents indexed: {}", health.status, health.documents_indexed);
        }
        Commands::Suggest => {
            for (i, q) in SUGGESTED_QUERIES.iter().enumerate() {
                println!("{}. {}", i + 1, q);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// A failed answer has already been reported by the renderer.
fn answered(outcome: &SubmitOutcome) -> anyhow::Result<bool> {
    match outcome {
        SubmitOutcome::Ignored => anyhow::bail!("no question given"),
        SubmitOutcome::Failed(_) => Ok(false),
        SubmitOutcome::Completed(_) | SubmitOutcome::Stopped(_) => Ok(true),
    }
}

fn print_upload(record: &UploadRecord) {
    match &record.message {
        Some(message) => println!("{message}"),
        None => println!("Indexed {} chunks from {}", record.chunk_count, record.name),
    }
}

/// Ctrl-C stops the streaming answer; with nothing streaming it exits.
fn spawn_interrupt_handler<B: ChatBackend + 'static>(session: Arc<ChatSession<B>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !session.cancel() {
                std::process::exit(130);
            }
        }
    })
}

async fn ask<B: ChatBackend>(session: &ChatSession<B>, question: &str) -> anyhow::Result<SubmitOutcome> {
    let mut rx = session.subscribe();
    let mut renderer = TerminalRenderer::new(std::io::stdout());
    Ok(drive(session.submit(question), &mut rx, &mut renderer).await?)
}

const HELP: &str = "\
commands:
  /source <database|internet|both>   change where answers come from
  /upload <file.pdf>                 index a document
  /suggest                           list suggested questions
  /ask <n>                           ask suggested question n
  /status                            show session status and uploads
  /clear                             forget the conversation
  /quit                              leave
anything else is sent as a question; Ctrl-C stops an answer";

async fn run_chat<B: ChatBackend + 'static>(session: Arc<ChatSession<B>>) -> anyhow::Result<()> {
    let _interrupts = spawn_interrupt_handler(session.clone());
    println!("MiningNiti assistant (source: {}). Type /help for commands.", session.snapshot().source);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, arg) = line.split_once(' ').map(|(c, a)| (c, a.trim())).unwrap_or((line, ""));
        match command {
            "" => {}
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/clear" => {
                session.clear();
                println!("conversation cleared");
            }
            "/status" => {
                let state = session.snapshot();
                let stopped = state.exchanges.iter().filter(|e| e.stopped).count();
                println!(
                    "status: {:?}, source: {}, exchanges: {} ({} stopped)",
                    state.status(),
                    state.source,
                    state.exchanges.len(),
                    stopped
                );
                for upload in &state.uploads {
                    println!("  {} ({} chunks, {})", upload.name, upload.chunk_count, upload.uploaded_at.format("%Y-%m-%d %H:%M"));
                }
            }
            "/suggest" => {
                for (i, q) in SUGGESTED_QUERIES.iter().enumerate() {
                    println!("{}. {}", i + 1, q);
                }
            }
            "/source" => match arg.parse::<SourceMode>() {
                Ok(source) => {
                    session.set_source(source);
                    println!("source: {source}");
                }
                Err(e) => println!("{e}"),
            },
            "/upload" => match session.upload(std::path::Path::new(arg)).await {
                Ok(record) => print_upload(&record),
                Err(message) => println!("error: {message}"),
            },
            "/ask" => match arg.parse::<usize>().ok().and_then(|n| n.checked_sub(1)).and_then(|i| SUGGESTED_QUERIES.get(i)) {
                Some(question) => {
                    println!("> {question}");
                    ask(&session, question).await?;
                }
                None => println!("pick a number from /suggest"),
            },
            _ => {
                session.set_input(line);
                let mut rx = session.subscribe();
                let mut renderer = TerminalRenderer::new(std::io::stdout());
                drive(session.submit_input(), &mut rx, &mut renderer).await?;
            }
        }
    }
    Ok(())
}
