use clap::Parser;
use energy_cluster::commands::{parse_command, CommandError, CommandResponse};
use energy_cluster::config::{EngineConfig, StoreKind};
use energy_cluster::store::{JsonFileStore, MemoryStore, Store};
use energy_cluster::{ClusterEngine, ErrorKind};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Cooperative energy cluster engine, driven by JSON-line commands on stdin
#[derive(Parser, Debug)]
#[command(name = "energy-cluster", version, about)]
struct Args {
    /// Path to a TOML engine config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Persist to JSON files in this directory (overrides the config store)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.store.kind = StoreKind::Json;
        config.store.dir = dir;
    }

    let store: Arc<dyn Store> = match config.store.kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::Json => Arc::new(JsonFileStore::open(&config.store.dir)?),
    };

    info!(store = ?config.store.kind, "energy cluster engine starting");
    let engine = ClusterEngine::new(store, config);

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match parse_command(line.as_bytes()) {
            Ok(cmd) => engine.handle_command(&cmd),
            Err(e) => {
                error!(error = %e, "unparseable command");
                CommandResponse {
                    request_id: String::new(),
                    ok: false,
                    result: None,
                    error: Some(CommandError {
                        kind: ErrorKind::InvalidInput,
                        message: format!("unparseable command: {}", e),
                    }),
                }
            }
        };

        serde_json::to_writer(&mut stdout, &response)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;
    }

    info!("input closed, shutting down");
    Ok(())
}
