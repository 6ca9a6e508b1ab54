pub mod commands;
pub mod dispatch;
pub mod handler;
pub mod telegram_client;
pub mod transport;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

use crate::config::{BotConfig, Secrets};
use crate::logging::LogLevelHandle;
use crate::openrouter::OpenRouterClient;
use crate::store::SettingsStore;

pub use dispatch::{Dispatcher, RetryPolicy};
pub use handler::{ChatHandler, IncomingMessage};
use handler::TIMEOUT_NOTICE;
pub use telegram_client::TelegramClient;
pub use transport::ChatTransport;

pub async fn run(
    config: BotConfig,
    secrets: Secrets,
    store: Arc<SettingsStore>,
    log_level: LogLevelHandle,
) -> Result<()> {
    tracing::info!(component = "gateway", "Starting Telegram gateway");

    let bot = Bot::new(&secrets.bot_token);
    let me = bot.get_me().await.context("Failed to authorize with Telegram")?;
    let bot_name = me.username().to_string();
    tracing::info!(component = "gateway", bot = %bot_name, "Bot authorized");

    if let Err(e) = bot.set_my_commands(commands::Command::bot_commands()).await {
        tracing::warn!(component = "gateway", error = %e, "Failed to register bot commands");
    }

    let transport: Arc<dyn ChatTransport> = Arc::new(TelegramClient::new(bot.clone()));
    let dispatcher = Dispatcher::new(
        transport,
        RetryPolicy::from_config(&config.telegram),
        config.telegram.message_format,
        config.telegram.max_part_size,
    );
    let handler = Arc::new(ChatHandler::new(
        store,
        Arc::new(OpenRouterClient::new(&config.openrouter)),
        dispatcher,
        secrets.password,
        bot_name,
        log_level,
    ));
    let timeout = Duration::from_secs(config.telegram.handler_timeout_secs);

    tracing::info!(component = "gateway", "Telegram bot ready, waiting for messages");

    teloxide::repl(bot, move |msg: Message| {
        let handler = handler.clone();
        async move {
            let Some(user) = msg.from.as_ref() else {
                return Ok(());
            };
            let incoming = IncomingMessage {
                chat_id: msg.chat.id.0,
                user_id: user.id.0 as i64,
                text: msg.text().map(str::to_string),
            };
            tokio::spawn(handle_with_timeout(handler, incoming, timeout));
            Ok(())
        }
    })
    .await;

    Ok(())
}

/// Run one message under a deadline. On elapse the handling future is
/// dropped, which also drops any in-flight HTTP request.
async fn handle_with_timeout(handler: Arc<ChatHandler>, msg: IncomingMessage, timeout: Duration) {
    let request_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        component = "gateway",
        request_id = %request_id,
        chat_id = msg.chat_id,
        user_id = msg.user_id,
        message_len = msg.text.as_deref().map_or(0, |t| t.chars().count()),
        "Received message"
    );

    let deadline = tokio::time::Instant::now() + timeout;
    match tokio::time::timeout(timeout, handler.handle(&msg, &request_id, deadline)).await {
        Ok(Ok(())) => {
            tracing::info!(component = "gateway", request_id = %request_id, "Message handling completed");
        }
        Ok(Err(e)) => {
            tracing::error!(
                component = "gateway",
                request_id = %request_id,
                error = ?e,
                "Message handling failed"
            );
        }
        Err(_) => {
            tracing::error!(
                component = "gateway",
                request_id = %request_id,
                timeout_secs = timeout.as_secs(),
                "Message handling timed out"
            );
            handler
                .dispatcher()
                .send_plain(msg.chat_id, TIMEOUT_NOTICE, &request_id)
                .await;
        }
    }
}
