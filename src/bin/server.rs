//! Demo network-server binary: loads config, wires an in-memory [`Store`]
//! and a `tracing`-backed warning sink, and runs the GWMP UDP listener.
//!
//! This is demonstration/integration surface, not the engine itself — see
//! `src/lib.rs` for the actual MAC-layer logic this binary drives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use lorawan_engine::config::Config;
use lorawan_engine::gateway;
use lorawan_engine::store::memory::MemoryStore;
use lorawan_engine::warnings::TracingWarnSink;

#[derive(Parser)]
#[command(about = "LoRaWAN MAC-engine demo network server")]
struct Args {
    /// Path to a TOML config file; falls back to built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .init();

    let store: Arc<dyn lorawan_engine::store::Store> = Arc::new(MemoryStore::new());
    let warn: Arc<dyn lorawan_engine::warnings::WarnSink> = Arc::new(TracingWarnSink);

    let _downlink_sender = gateway::start_server(&config, store, warn).await?;

    // The receive loop runs in its own spawned task; keep this process
    // alive indefinitely.
    std::future::pending::<()>().await;
    Ok(())
}
