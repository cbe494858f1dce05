use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use leasehold_core::observer::{resolve_repo_root, SystemCommandRunner};
use leasehold_core::{Config, LeaseDb};
use tracing::info;

#[derive(Args)]
pub struct InitArgs {
    /// Coordination database path, relative to the repository root.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Overwrite an existing config with defaults.
    #[arg(long)]
    force: bool,
}

pub fn execute(args: InitArgs) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let repo_root = resolve_repo_root(&SystemCommandRunner, &cwd);

    let config_path = Config::path_in(&repo_root);
    if config_path.exists() && !args.force {
        println!("already initialized: {}", config_path.display());
        return Ok(());
    }

    let mut config = Config::default();
    if let Some(db_path) = args.db_path {
        config.store.db_path = db_path;
    }
    config.save_to(&config_path)?;

    let db_path = config.db_path_in(&repo_root);
    let db = LeaseDb::open(&db_path)?;
    info!(version = db.schema_version()?, "coordination database ready");

    println!("initialized leasehold in {}", repo_root.display());
    println!("  config:   {}", config_path.display());
    println!("  database: {}", db_path.display());
    Ok(())
}
