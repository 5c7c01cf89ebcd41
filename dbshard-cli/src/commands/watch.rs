//! Watch command - hold every target open with live probes until signalled

use std::ops::ControlFlow;

use anyhow::{Context, Result};
use clap::Parser;
use dbshard_core::{ConnectionSet, ProcessLifecycle};
use tracing::info;

use super::check::layout_lines;
use super::ConfigArg;

#[derive(Parser, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    pub config: ConfigArg,
}

pub async fn run_watch(args: WatchArgs) -> Result<()> {
    let configs = args.config.load()?;
    let set = ConnectionSet::build(configs)
        .await
        .context("failed to open shard targets")?;

    for line in layout_lines(&set) {
        println!("{line}");
    }
    info!(handles = set.len(), "probing; send SIGINT or SIGTERM to stop");

    let lifecycle = ProcessLifecycle::new();
    lifecycle
        .handle_signals(|sig| {
            if sig.is_shutdown() {
                info!(signal = ?sig, "shutting down");
                ControlFlow::Break(())
            } else {
                info!(signal = ?sig, "ignoring signal");
                ControlFlow::Continue(())
            }
        })
        .await
        .context("failed to listen for signals")?;

    set.close_all().await.context("failed to close shard targets")?;
    Ok(())
}
