//! ## ringcap-cli
//! **Capture host for AF_PACKET ring sources**
//!
//! Opens a capture source, drains it whenever its descriptor turns readable
//! and reports statistics until interrupted.

use clap::Parser;

mod commands;

use commands::Cli;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::run_command(cli).await
}
