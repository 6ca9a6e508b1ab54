mod cli;
mod config;
mod formatter;
mod gateway;
mod logging;
mod openrouter;
mod store;

use anyhow::Result;
use clap::Parser;
use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::run(cli).await
}
