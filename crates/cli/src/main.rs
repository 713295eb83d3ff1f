mod config;
mod metrics;
mod pipeline;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{AppConfig, OperationMode};
use index::EmbedderKind;

#[derive(Parser)]
#[command(name = "tablerag", version)]
#[command(about = "Detect nested tables in PDF documents, index them, and answer questions about them")]
struct Cli {
    /// Write logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect and index the tables of a PDF (or layout JSON) into an artifact
    Process {
        /// Input PDF or layout JSON
        input: PathBuf,

        /// Artifact file to write
        artifact: PathBuf,

        /// JSON config file; missing fields keep their defaults
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum)]
        mode: Option<OperationMode>,

        /// Embedding provider
        #[arg(long, value_enum)]
        embedder: Option<EmbedderArg>,
    },

    /// Answer a question from a processed artifact
    Query {
        artifact: PathBuf,

        query: String,

        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of matches to return
        #[arg(long)]
        top_k: Option<usize>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the nested table tree stored in an artifact
    Inspect {
        artifact: PathBuf,

        /// Print the tree as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EmbedderArg {
    Hashing,
    Ollama,
}

impl From<EmbedderArg> for EmbedderKind {
    fn from(arg: EmbedderArg) -> Self {
        match arg {
            EmbedderArg::Hashing => EmbedderKind::Hashing,
            EmbedderArg::Ollama => EmbedderKind::Ollama,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Cancels `token` on Ctrl-C; work stops at the next table boundary.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current table");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Process {
            input,
            artifact,
            config,
            mode,
            embedder,
        } => {
            let mut config = AppConfig::load(config.as_deref(), mode).await?;
            if let Some(embedder) = embedder {
                config.embedder.kind = embedder.into();
            }
            info!(mode = ?config.mode, embedder = ?config.embedder.kind, "Processing {}", input.display());

            let cancel = CancellationToken::new();
            cancel_on_interrupt(cancel.clone());

            let summary = pipeline::process_document(&input, &artifact, &config, &cancel).await?;
            println!("{}", summary.render());
            println!("Artifact written to {}", artifact.display());
        }
        Command::Query {
            artifact,
            query,
            config,
            top_k,
            json,
        } => {
            let mut config = AppConfig::load(config.as_deref(), None).await?;
            if let Some(top_k) = top_k {
                config.query.top_k = top_k;
            }

            let response = pipeline::answer_query(&artifact, &query, &config).await?;
            if json {
                let rendered = serde_json::to_string_pretty(&response).context("Failed to encode response")?;
                println!("{rendered}");
            } else {
                println!("{}", response.text());
            }
        }
        Command::Inspect { artifact, json } => {
            let tables = pipeline::inspect_artifact(&artifact).await?;
            if json {
                let rendered = serde_json::to_string_pretty(&tables).context("Failed to encode table tree")?;
                println!("{rendered}");
            } else {
                println!("{}", pipeline::render_outline(&tables));
            }
        }
    }

    Ok(())
}
