use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use leasehold_core::observer::{resolve_repo_root, SystemCommandRunner};
use leasehold_core::{Config, ProcessSupervisor, SupervisorOptions};

#[derive(Args)]
pub struct RunArgs {
    /// Client override: codex, claude, cursor, or aider.
    #[arg(long)]
    client: Option<String>,

    /// Coordination database path override.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Working-tree poll interval in seconds.
    #[arg(long)]
    poll_interval: Option<f64>,

    /// Lease TTL in seconds.
    #[arg(long)]
    ttl_seconds: Option<u64>,

    /// Description attached to leases this session takes.
    #[arg(long)]
    description: Option<String>,

    /// The command to supervise.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve current directory")?;
    let repo_root = resolve_repo_root(&SystemCommandRunner, &cwd);
    let config = Config::load(&repo_root)?;

    let poll_seconds = args
        .poll_interval
        .unwrap_or(config.supervisor.poll_interval_ms as f64 / 1000.0);
    if !poll_seconds.is_finite() || poll_seconds <= 0.0 {
        bail!("poll interval must be a positive number of seconds");
    }

    let options = SupervisorOptions {
        client: args.client,
        command: args.command,
        db_path: args.db_path.unwrap_or_else(|| config.db_path_in(&repo_root)),
        poll_interval: Duration::from_secs_f64(poll_seconds),
        ttl: Duration::from_secs(args.ttl_seconds.unwrap_or(config.locks.default_ttl_sec)),
        description: args.description,
        cleanup_interval: Duration::from_secs(config.locks.cleanup_interval_sec),
        heartbeat_interval: Duration::from_secs(config.supervisor.heartbeat_interval_sec),
        stale_after: Duration::from_secs(config.supervisor.stale_after_sec),
    };

    let supervisor = ProcessSupervisor::new(options)?;
    let exit_code = supervisor.run().await?;
    std::process::exit(exit_code);
}
