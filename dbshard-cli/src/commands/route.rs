//! Route command - preview shard assignment from configuration alone

use anyhow::{anyhow, Result};
use clap::Parser;
use dbshard_core::{ConnectionSet, ShardKey};
use serde_json::json;

use super::ConfigArg;

#[derive(Parser, Debug)]
pub struct RouteArgs {
    #[command(flatten)]
    pub config: ConfigArg,

    /// Tag to route within
    #[arg(long, short = 't')]
    pub tag: String,

    /// Integer shard key (selects index mod pool length)
    #[arg(long, allow_hyphen_values = true, conflicts_with = "key")]
    pub index: Option<i64>,

    /// String shard key (hashed)
    #[arg(long, short = 'k')]
    pub key: Option<String>,

    /// Print the result as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn run_route(args: RouteArgs) -> Result<()> {
    let plan = ConnectionSet::plan(args.config.load()?)?;

    let key = match (args.index, args.key) {
        (Some(index), _) => Some(ShardKey::Index(index)),
        (None, Some(key)) => Some(ShardKey::Hash(key)),
        (None, None) => None,
    };

    let len = plan.pool_len(&args.tag);
    let target = plan
        .get(&args.tag, key.clone())
        .ok_or_else(|| anyhow!("unknown tag '{}'", args.tag))?;
    let index = key.as_ref().map_or(0, |key| key.bucket(len));

    if args.json {
        let out = json!({
            "tag": args.tag,
            "index": index,
            "pool_len": len,
            "id": target.id,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!(
            "{}[{}/{}] {} {}",
            args.tag,
            index,
            len,
            target.id,
            target.redacted_target()
        );
    }
    Ok(())
}
