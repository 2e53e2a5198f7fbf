//! # Darwin CLI
//!
//! | Command | Description |
//! |---------|-------------|
//! | `darwin init` | Create the store schema and declare vector indices |
//! | `darwin ingest <file>` | Ingest a JSON array of signals from a file |
//! | `darwin serve` | Start the HTTP API and background workers |
//! | `darwin status` | Show queue depths and record counts |
//!
//! All commands accept `--config` (default `./config/darwin.toml`).
//!
//! Exit codes: `0` success, `1` configuration or usage error, `2` store
//! unavailable, `3` external provider failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use darwin::config::{self, Config};
use darwin::context::AppContext;
use darwin::embedding::create_embedder;
use darwin::fix::create_agent;
use darwin::forge::create_forge;
use darwin::ingest::IngestService;
use darwin::llm::create_llm;
use darwin::models::SignalIn;
use darwin::server;
use darwin::store::{self, SharedStore};

const EXIT_CONFIG: u8 = 1;
const EXIT_STORE: u8 = 2;
const EXIT_PROVIDER: u8 = 3;

/// Darwin — a pipeline that turns raw user feedback into code-change
/// proposals.
#[derive(Parser)]
#[command(
    name = "darwin",
    about = "Darwin — turn raw user feedback into code-change proposals",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "./config/darwin.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema and vector indices.
    ///
    /// Idempotent — safe to run multiple times.
    Init,

    /// Ingest signals from a JSON file (an array of signal objects).
    Ingest {
        /// Path to the JSON file.
        file: PathBuf,
    },

    /// Start the HTTP API with the embed and classify workers.
    Serve,

    /// Show queue depths, dead-letter sizes, and record counts.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let store = match store::connect(&config.store.url).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "store unavailable");
            return ExitCode::from(EXIT_STORE);
        }
    };
    if let Err(e) = AppContext::declare_indices(&store, &config).await {
        error!(error = %e, "store unavailable");
        return ExitCode::from(EXIT_STORE);
    }

    match cli.command {
        Commands::Init => {
            println!("Store initialized successfully.");
            ExitCode::SUCCESS
        }
        Commands::Ingest { file } => run_ingest(&config, store, &file).await,
        Commands::Serve => run_serve(config, store).await,
        Commands::Status => run_status(store).await,
    }
}

async fn run_ingest(config: &Config, store: SharedStore, file: &PathBuf) -> ExitCode {
    let raw = match std::fs::read_to_string(file) {
        Ok(raw) => raw,
        Err(e) => {
            error!(file = %file.display(), error = %e, "cannot read signal file");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let signals: Vec<SignalIn> = match serde_json::from_str(&raw) {
        Ok(signals) => signals,
        Err(e) => {
            error!(file = %file.display(), error = %e, "signal file is not a JSON array of signals");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let service = IngestService::new(store, config.worker.embed_backpressure);
    let result = service.ingest_batch(signals).await;

    println!("ingest {}", file.display());
    println!("  total: {}", result.total);
    println!("  queued: {}", result.queued);
    println!("  duplicates: {}", result.duplicates);
    println!("  invalid: {}", result.invalid);
    if result.errors > 0 {
        println!("  errors: {}", result.errors);
        return ExitCode::from(EXIT_STORE);
    }
    if result.delayed {
        println!("  note: embed queue past backpressure bound; consider more workers");
    }
    println!("ok");
    ExitCode::SUCCESS
}

async fn run_serve(config: Config, store: SharedStore) -> ExitCode {
    let embedder = match create_embedder(&config.embedding) {
        Ok(embedder) => Arc::from(embedder),
        Err(e) => {
            error!(error = %e, "embedding provider failure");
            return ExitCode::from(EXIT_PROVIDER);
        }
    };
    let llm = match create_llm(&config.llm) {
        Ok(llm) => Arc::from(llm),
        Err(e) => {
            error!(error = %e, "llm provider failure");
            return ExitCode::from(EXIT_PROVIDER);
        }
    };
    let agent = match create_agent(&config.fix) {
        Ok(agent) => agent,
        Err(e) => {
            error!(error = %e, "fix agent failure");
            return ExitCode::from(EXIT_PROVIDER);
        }
    };
    let forge = create_forge();

    let context = Arc::new(AppContext::new(config, store, embedder, llm, agent, forge));
    let workers = context.spawn_workers();

    let result = server::run_server(context.clone()).await;

    info!("server stopped, draining workers");
    context.shutdown_workers(workers).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server error");
            ExitCode::from(EXIT_STORE)
        }
    }
}

async fn run_status(store: SharedStore) -> ExitCode {
    use darwin::store::{
        QUEUE_CLASSIFY, QUEUE_CLASSIFY_DEAD, QUEUE_EMBED, QUEUE_EMBED_DEAD, QUEUE_TRIAGE,
    };

    let queues = [
        ("to-embed", QUEUE_EMBED),
        ("to-classify", QUEUE_CLASSIFY),
        ("triage", QUEUE_TRIAGE),
        ("to-embed dead", QUEUE_EMBED_DEAD),
        ("to-classify dead", QUEUE_CLASSIFY_DEAD),
    ];

    println!("queues:");
    for (label, queue) in queues {
        match store.queue_len(queue).await {
            Ok(len) => println!("  {:<18} {}", label, len),
            Err(e) => {
                error!(queue, error = %e, "store unavailable");
                return ExitCode::from(EXIT_STORE);
            }
        }
    }

    println!("records:");
    for (label, prefix) in [
        ("signals", "signal:"),
        ("topics", "topic:"),
        ("tasks", "task:"),
        ("successful fixes", "fix:success:"),
        ("rules", "rule:"),
    ] {
        match store.scan_records(prefix).await {
            Ok(records) => println!("  {:<18} {}", label, records.len()),
            Err(e) => {
                error!(prefix, error = %e, "store unavailable");
                return ExitCode::from(EXIT_STORE);
            }
        }
    }

    ExitCode::SUCCESS
}
