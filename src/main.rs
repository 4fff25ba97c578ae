#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use weighted_maglev::config::AppConfig;
use weighted_maglev::state::build_state;
use weighted_maglev::{reloader, server};

#[derive(Parser)]
#[command(name = "weighted_maglev", about = "Weighted Maglev lookup table service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file
    #[arg(default_value = "config.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Print a sample configuration file and exit
    GenerateConfig,
    /// Build the table once and print how slots are distributed
    Inspect,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::GenerateConfig) = cli.command {
        print!("{}", SAMPLE_CONFIG);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::load(&cli.config)?;
    let initial = build_state(&config, None)?;

    if let Some(Command::Inspect) = cli.command {
        let counts = initial.table.slot_counts(initial.shards.len());
        let shards: Vec<_> = initial
            .shards
            .iter()
            .zip(counts)
            .map(|(shard, slots)| {
                json!({
                    "name": shard.name,
                    "weight": shard.weight,
                    "hash": format!("{:016x}", shard.hash),
                    "slots": slots,
                    "share": slots as f64 / config.table_size as f64,
                })
            })
            .collect();
        let report = json!({ "table_size": config.table_size, "shards": shards });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    info!(
        listen = %config.listen,
        table_size = config.table_size,
        shards = config.shards.len(),
        "starting weighted_maglev"
    );

    let listen_addr = config.listen.clone();
    let shared_state = Arc::new(ArcSwap::from_pointee(initial));

    tokio::spawn(reloader::run_reload_loop(
        cli.config.clone(),
        Arc::new(config),
        shared_state.clone(),
    ));

    let app = server::router(shared_state);
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(addr = %listen_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# weighted_maglev configuration

# Address to listen on
listen = "0.0.0.0:8080"

# Number of slots in the lookup table. Must be a power of two and must
# never change during the lifetime of the cluster: every client computes
# `table[hash(key) % table_size]`.
table_size = 65536

# Seeds for hashing shard names and lookup keys (xxh3).
shard_seed = 0
item_seed = 1

# How often to re-read this file and rebuild the table (seconds).
# Only shard and seed changes are picked up without a restart.
reload_interval_secs = 10

# Backends. Weights are relative: 1, 1, 2 and 100, 100, 200 are the same.
# Changing one weight moves only a small share of slots.

[[shards]]
name = "backend-a"
weight = 1.0

[[shards]]
name = "backend-b"
weight = 1.0

[[shards]]
name = "backend-c"
weight = 2.0
"#;
