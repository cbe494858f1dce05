mod init;
mod locks;
mod run;

use anyhow::Result;
use clap::Subcommand;

#[derive(Subcommand)]
pub enum Command {
    /// Initialize the coordination database and config for this repository.
    Init(init::InitArgs),
    /// Run a command under automatic lease supervision.
    Run(run::RunArgs),
    /// Show active leases.
    Locks(locks::LocksArgs),
}

pub async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Init(args) => init::execute(args),
        Command::Run(args) => run::execute(args).await,
        Command::Locks(args) => locks::execute(args).await,
    }
}
