//! Check command - open every target once, print the layout, close

use anyhow::{Context, Result};
use clap::Parser;
use dbshard_core::{ConnectionHandle, ConnectionSet};
use tracing::info;

use super::ConfigArg;

#[derive(Parser, Debug)]
pub struct CheckArgs {
    #[command(flatten)]
    pub config: ConfigArg,
}

pub async fn run_check(args: CheckArgs) -> Result<()> {
    let configs = args.config.load()?;
    info!(targets = configs.total(), "opening shard targets");

    let set = ConnectionSet::build(configs)
        .await
        .context("failed to open shard targets")?;

    for line in layout_lines(&set) {
        println!("{line}");
    }

    let reachable = set.len();
    set.close_all().await.context("failed to close shard targets")?;
    println!("✓ {reachable} target(s) reachable");
    Ok(())
}

/// `tag[index] id (keepalive Ns)` lines, sorted by tag then index
pub(crate) fn layout_lines(set: &ConnectionSet<ConnectionHandle>) -> Vec<String> {
    let mut rows = Vec::with_capacity(set.len());
    set.for_each(|tag, idx, handle| {
        rows.push((
            tag.to_string(),
            idx,
            format!(
                "{tag}[{idx}] {} {} (keepalive {}s)",
                handle.id(),
                handle.config().redacted_target(),
                handle.keepalive().as_secs()
            ),
        ));
    });
    rows.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
    rows.into_iter().map(|(_, _, line)| line).collect()
}
