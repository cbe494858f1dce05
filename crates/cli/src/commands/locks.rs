use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use leasehold_core::observer::{resolve_repo_root, SystemCommandRunner};
use leasehold_core::{Config, LeaseDb, LockCoordinator};

#[derive(Args)]
pub struct LocksArgs {
    /// Only show leases held by this agent.
    #[arg(long)]
    agent: Option<String>,

    /// Coordination database path override.
    #[arg(long)]
    db_path: Option<PathBuf>,
}

pub async fn execute(args: LocksArgs) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let repo_root = resolve_repo_root(&SystemCommandRunner, &cwd);
    let config = Config::load(&repo_root)?;
    let db_path = args.db_path.unwrap_or_else(|| config.db_path_in(&repo_root));

    let now = Utc::now();
    let db = LeaseDb::open(&db_path)?;
    let coordinator = LockCoordinator::recover(db, now)?;

    let leases = match args.agent.as_deref() {
        Some(agent) => coordinator.list_by_holder(agent, now).await,
        None => coordinator.list_all(now).await,
    };

    if leases.is_empty() {
        println!("no active leases");
        return Ok(());
    }

    for lease in leases {
        let remaining = (lease.expires_at - now).num_seconds().max(0);
        println!(
            "{}  held by {}  ({})  expires in {}s",
            lease.resource_path, lease.agent_id, lease.description, remaining
        );
    }
    Ok(())
}
