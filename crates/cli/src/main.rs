mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Lease-based file coordination for agent sessions.
#[derive(Parser)]
#[command(name = "leasehold", version, about)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli.command).await
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::Cli;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_accepts_a_trailing_command() {
        let parsed = Cli::try_parse_from([
            "leasehold",
            "run",
            "--client",
            "codex",
            "--ttl-seconds",
            "600",
            "claude",
            "--dangerously-skip-permissions",
        ]);
        assert!(parsed.is_ok());
    }

    #[test]
    fn run_without_a_command_is_rejected() {
        assert!(Cli::try_parse_from(["leasehold", "run"]).is_err());
    }
}
