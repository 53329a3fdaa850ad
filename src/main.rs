//! # docchat CLI
//!
//! ## Usage
//!
//! ```bash
//! docchat --config ./config/docchat.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docchat serve` | Start the HTTP server |
//! | `docchat ask "<question>" --file <path>` | Index files in-process and stream an answer |
//! | `docchat chat "<message>"` | Direct chat with a backend, no retrieval |
//! | `docchat check` | Validate the config and list chat backends |
//!
//! ## Examples
//!
//! ```bash
//! # Ask a question about two local files
//! docchat ask "What was Q3 revenue?" --file report.pdf --file notes.md
//!
//! # Start the server with JSON logs
//! RUST_LOG=docchat=debug docchat serve --log-json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use docchat::config::{self, Config};
use docchat::embedding::create_provider;
use docchat::encoder::{answer_frames, chat_events, encode_frame, EncoderSettings};
use docchat::index::IndexBuilder;
use docchat::loader::DocumentLoader;
use docchat::progress::ProgressMode;
use docchat::query::{QueryEngine, QuerySettings};
use docchat::router::ChatRouter;
use docchat::store::{InMemoryVectorStore, VectorStore};

/// docchat: upload documents, ask questions, get streamed answers with
/// sources.
#[derive(Parser)]
#[command(name = "docchat", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docchat.toml`. If the default file is missing,
    /// built-in defaults are used.
    #[arg(long, global = true, default_value = "./config/docchat.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Index the given files and answer one question.
    ///
    /// Answer events are written to stdout as `data: {json}` frames.
    Ask {
        question: String,

        /// File or directory to index (repeatable).
        #[arg(long = "file", short = 'f', required = true)]
        files: Vec<PathBuf>,

        /// Backend name from `[chat.backends]` used to answer.
        #[arg(long)]
        backend: Option<String>,
    },

    /// Chat with a backend directly, without retrieval.
    Chat {
        message: String,

        /// Backend name from `[chat.backends]`.
        #[arg(long)]
        backend: Option<String>,
    },

    /// Validate the configuration and list chat backends.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let cfg = load(&cli.config)?;

    match cli.command {
        Commands::Serve => docchat::server::run_server(&cfg).await?,
        Commands::Ask {
            question,
            files,
            backend,
        } => run_ask(&cfg, &question, &files, backend.as_deref()).await?,
        Commands::Chat { message, backend } => run_chat(&cfg, &message, backend.as_deref()).await?,
        Commands::Check => run_check(&cfg)?,
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docchat=info,tower_http=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() && path == Path::new("./config/docchat.toml") {
        tracing::info!("no config file at {}, using defaults", path.display());
        return Ok(Config::minimal());
    }
    config::load_config(path)
}

async fn run_ask(
    cfg: &Config,
    question: &str,
    files: &[PathBuf],
    backend: Option<&str>,
) -> anyhow::Result<()> {
    let loader = DocumentLoader::new(cfg.chunking.max_tokens);
    let mut segments = Vec::new();
    for path in files {
        let loaded = loader
            .load(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        segments.extend(loaded);
    }

    let embedder = create_provider(&cfg.embedding)?;
    let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
    let router = Arc::new(ChatRouter::from_config(&cfg.chat)?);

    let builder = IndexBuilder::new(Arc::clone(&embedder), Arc::clone(&store)).with_batching(
        cfg.indexing.batch_size,
        Duration::from_millis(cfg.indexing.batch_pause_ms),
    );
    let progress = ProgressMode::default_for_tty().reporter();
    let handle = builder
        .build(&cfg.storage.collection, segments, progress.as_ref())
        .await
        .context("indexing failed")?;

    let engine = QueryEngine::new(
        embedder,
        store,
        Arc::clone(&router),
        QuerySettings::from_config(&cfg.retrieval, &cfg.chat.role_description),
    );
    let settings = EncoderSettings {
        max_sources: cfg.retrieval.max_sources,
        chunk_words: router.chunk_words(),
        chunk_delay: router.chunk_delay(),
    };

    let result = engine.query(&handle, question, backend).await;
    let mut frames = answer_frames(result, settings);
    while let Some(frame) = frames.next().await {
        print!("{frame}");
    }
    Ok(())
}

async fn run_chat(cfg: &Config, message: &str, backend: Option<&str>) -> anyhow::Result<()> {
    let router = ChatRouter::from_config(&cfg.chat)?;
    let fragments = router.stream_chat(message, &cfg.chat.role_description, backend);
    let mut events = chat_events(fragments);
    while let Some(event) = events.next().await {
        print!("{}", encode_frame(&event));
    }
    Ok(())
}

fn run_check(cfg: &Config) -> anyhow::Result<()> {
    config::validate(cfg)?;
    let router = ChatRouter::from_config(&cfg.chat)?;
    println!("Configuration OK.");
    println!("  upload dir:  {}", cfg.storage.upload_dir.display());
    println!("  embeddings:  {}", cfg.embedding.provider);
    if router.backend_names().is_empty() {
        println!("  chat:        no backends configured");
    } else {
        for name in router.backend_names() {
            let marker = if Some(name) == router.default_backend() {
                " (default)"
            } else {
                ""
            };
            println!("  chat:        {name}{marker}");
        }
    }
    Ok(())
}
