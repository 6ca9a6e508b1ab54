use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::formatter::MessageFormat;

pub const TELEGRAM_TOKEN_ENV: &str = "TELEGRAM_TOKEN";
pub const BOT_PASSWORD_ENV: &str = "BOT_PASSWORD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    pub base_dir: Option<String>,
}

impl PathsConfig {
    pub fn base_dir(&self) -> PathBuf {
        if let Some(ref base) = self.base_dir {
            PathBuf::from(base)
        } else {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".orbot")
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base_dir().join("config.toml")
    }

    /// Per-user settings and authorizations.
    pub fn store_file(&self) -> PathBuf {
        self.base_dir().join("bot_config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir().join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("orbot.jsonl")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Falls back to the TELEGRAM_TOKEN environment variable when empty.
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub message_format: MessageFormat,
    /// Characters per outbound message, below Telegram's 4096 cap.
    #[serde(default = "default_max_part_size")]
    pub max_part_size: usize,
    /// Deadline for handling one incoming message.
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_part_delay_ms")]
    pub part_delay_ms: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            message_format: MessageFormat::default(),
            max_part_size: default_max_part_size(),
            handler_timeout_secs: default_handler_timeout(),
            max_send_attempts: default_max_send_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            part_delay_ms: default_part_delay_ms(),
        }
    }
}

fn default_max_part_size() -> usize {
    4000
}

fn default_handler_timeout() -> u64 {
    180
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_part_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_title")]
    pub title: String,
    /// Model selected for new users.
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Model table given to new users, name to OpenRouter id.
    #[serde(default = "default_models")]
    pub default_models: BTreeMap<String, String>,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            referer: default_referer(),
            title: default_title(),
            default_model: default_model(),
            default_models: default_models(),
        }
    }
}

fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_request_timeout() -> u64 {
    120
}

fn default_referer() -> String {
    "https://t.me/openrouter_bot".to_string()
}

fn default_title() -> String {
    "Telegram OpenRouter Bot".to_string()
}

fn default_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_models() -> BTreeMap<String, String> {
    [
        ("gpt-3.5-turbo", "openai/gpt-3.5-turbo"),
        ("gpt-4", "openai/gpt-4"),
        ("claude-instant", "anthropic/claude-instant-v1"),
        ("claude-2", "anthropic/claude-2"),
        ("llama-2-70b", "meta-llama/llama-2-70b-chat"),
        ("mistral-7b-instruct", "mistralai/mistral-7b-instruct-v0.1"),
    ]
    .into_iter()
    .map(|(name, id)| (name.to_string(), id.to_string()))
    .collect()
}

/// Values that never live in the config file.
#[derive(Clone)]
pub struct Secrets {
    pub bot_token: String,
    pub password: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("bot_token", &"<redacted>")
            .field("password", &"<redacted>")
            .finish()
    }
}

impl BotConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&PathsConfig::default().config_file())
    }

    pub fn load_from(config_file: &Path) -> Result<Self> {
        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)
                .with_context(|| format!("Failed to read config file {}", config_file.display()))?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&self.paths.config_file())
    }

    pub fn save_to(&self, config_file: &Path) -> Result<()> {
        if let Some(parent) = config_file.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_file, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Read the bot token and password from the environment.
    pub fn secrets(&self) -> Result<Secrets> {
        self.secrets_from(|key| std::env::var(key).ok())
    }

    pub fn secrets_from(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<Secrets> {
        let bot_token = if self.telegram.bot_token.is_empty() {
            lookup(TELEGRAM_TOKEN_ENV).unwrap_or_default()
        } else {
            self.telegram.bot_token.clone()
        };
        if bot_token.is_empty() {
            anyhow::bail!(
                "Telegram bot token is not configured (set telegram.bot_token or {TELEGRAM_TOKEN_ENV})"
            );
        }

        let password = lookup(BOT_PASSWORD_ENV).unwrap_or_default();
        if password.is_empty() {
            anyhow::bail!("{BOT_PASSWORD_ENV} environment variable is not set");
        }

        Ok(Secrets {
            bot_token,
            password,
        })
    }
}
