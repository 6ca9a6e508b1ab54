mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "orbot", version, about = "Password-gated Telegram bot for OpenRouter models")]
pub struct Cli {
    /// Config file (default: ~/.orbot/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the bot in the foreground
    Start,
    /// Show configuration, stored users and log size
    Status,
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Start => commands::start(config_path).await,
        Command::Status => commands::status(config_path).await,
        Command::Init { force } => commands::init(config_path, force),
    }
}
