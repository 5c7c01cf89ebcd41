//! Command implementations for dbshard CLI

pub mod check;
pub mod route;
pub mod watch;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use dbshard_core::ShardsConfig;

pub use check::run_check;
pub use route::run_route;
pub use watch::run_watch;

/// Shard configuration file shared by every command
#[derive(Args, Debug)]
pub struct ConfigArg {
    /// Shard config file (.json or .toml)
    #[arg(long, short = 'c', env = "DBSHARD_CONFIG", value_name = "PATH")]
    pub config: PathBuf,
}

impl ConfigArg {
    /// Load, expand and validate the config before anything connects
    pub fn load(&self) -> Result<ShardsConfig> {
        let config = ShardsConfig::from_path(&self.config)
            .with_context(|| format!("failed to load {}", self.config.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid shard config {}", self.config.display()))?;
        Ok(config)
    }
}
