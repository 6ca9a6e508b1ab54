use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::{BotConfig, PathsConfig, BOT_PASSWORD_ENV, TELEGRAM_TOKEN_ENV};
use crate::gateway;
use crate::logging;
use crate::store::SettingsStore;

fn load_config(config_path: Option<&Path>) -> Result<BotConfig> {
    match config_path {
        Some(path) => BotConfig::load_from(path),
        None => BotConfig::load(),
    }
}

pub async fn start(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let secrets = config.secrets()?;

    let store = Arc::new(
        SettingsStore::open(config.paths.store_file(), &config.openrouter)
            .context("Failed to load bot settings")?,
    );
    let (_guard, log_level) = logging::init_logging(&config.paths, store.log_level().await)?;

    tracing::info!(
        component = "cli",
        settings = %store.path().display(),
        format = ?config.telegram.message_format,
        "orbot starting"
    );

    tokio::select! {
        result = gateway::run(config, secrets, store, log_level) => {
            if let Err(ref e) = result {
                tracing::error!(component = "cli", error = %e, "Gateway error");
            }
            result
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!(component = "cli", "Shutting down...");
            Ok(())
        }
    }
}

pub async fn status(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let paths = &config.paths;

    let config_file = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathsConfig::default().config_file());
    let exists = if config_file.exists() { "" } else { " (not found, using defaults)" };
    println!("Config: {}{}", config_file.display(), exists);

    let token_source = if !config.telegram.bot_token.is_empty() {
        "config file"
    } else if std::env::var(TELEGRAM_TOKEN_ENV).is_ok_and(|v| !v.is_empty()) {
        TELEGRAM_TOKEN_ENV
    } else {
        "missing"
    };
    println!("Telegram token: {}", token_source);
    let password = if std::env::var(BOT_PASSWORD_ENV).is_ok_and(|v| !v.is_empty()) {
        "set"
    } else {
        "missing"
    };
    println!("Bot password ({}): {}", BOT_PASSWORD_ENV, password);
    println!("Message format: {:?}", config.telegram.message_format);
    println!("OpenRouter: {}", config.openrouter.base_url);

    let store = SettingsStore::open(paths.store_file(), &config.openrouter)?;
    let summary = store.summary().await;
    println!("\nSettings: {}", store.path().display());
    println!("  Users: {}", summary.users);
    println!("  Authorized: {}", summary.authorized);
    println!("  Log level: {}", summary.log_level);

    let size = logging::log_size(paths)?;
    println!(
        "\nLog file: {} ({})",
        paths.log_file().display(),
        logging::format_size(size)
    );

    Ok(())
}

pub fn init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let config = BotConfig::default();
    let config_file = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.paths.config_file());

    if config_file.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            config_file.display()
        );
        return Ok(());
    }

    match config_path {
        Some(path) => config.save_to(path)?,
        None => config.save()?,
    }
    println!("Wrote default config to {}", config_file.display());
    println!("Set {} and {} before running `orbot start`.", TELEGRAM_TOKEN_ENV, BOT_PASSWORD_ENV);
    Ok(())
}
