//! dbshard CLI - inspect and exercise a sharded MySQL topology
//!
//! - `check`: open every configured target once and report the layout
//! - `route`: preview which target a shard key lands on (no connections)
//! - `watch`: keep every target's liveness probe running until signalled

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod tracing_setup;

#[derive(Parser, Debug)]
#[command(
    name = "dbshard",
    author,
    version,
    about = "Tagged, sharded MySQL connection sets with deterministic routing"
)]
struct Cli {
    /// Enable debug logging (probe failures, panic reports)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open every configured target, print the layout, then close
    Check(commands::check::CheckArgs),
    /// Show which target a shard key routes to, without connecting
    Route(commands::route::RouteArgs),
    /// Open every target and keep probing until SIGINT/SIGTERM
    Watch(commands::watch::WatchArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // before parsing, so DBSHARD_CONFIG can come from .env
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    tracing_setup::init(&tracing_setup::TracingConfig { debug: cli.debug }).ok();

    match cli.command {
        Commands::Check(args) => commands::run_check(args).await?,
        Commands::Route(args) => commands::run_route(args)?,
        Commands::Watch(args) => commands::run_watch(args).await?,
    }
    Ok(())
}
