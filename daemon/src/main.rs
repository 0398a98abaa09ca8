//! Entry point of the `nodeagent` binary.

use clap::Parser as _;
use eyre::Result;
use nodeagent_daemon::{cli::Cli, inner_main};

#[tokio::main]
async fn main() -> Result<()> {
    inner_main(Cli::parse()).await
}
