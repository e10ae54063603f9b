//! Playback reconciliation hub.
//!
//! Owns the single playback session, funnels UI and physical commands through
//! one reconciler, and drives either the browser page or the hardware player.

mod api;
mod clock;
mod command_bus;
mod config;
mod events;
mod models;
mod openapi;
mod reconciler;
mod session;
mod startup;
mod state;
mod transport;
mod triggers;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "taptunes-hub")]
struct Args {
    /// HTTP bind address, e.g. 0.0.0.0:8080
    #[arg(long)]
    bind: Option<std::net::SocketAddr>,

    /// Hub config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,actix_web=info,taptunes_hub=info")
        }))
        .init();

    startup::run(args).await
}
