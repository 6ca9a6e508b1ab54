use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId};
use teloxide::{ApiError, RequestError};

use super::transport::{ChatTransport, SendError};
use crate::formatter::MessageFormat;

/// teloxide-backed chat transport
#[derive(Clone)]
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_text(
        &self,
        chat_id: i64,
        text: &str,
        format: MessageFormat,
    ) -> Result<(), SendError> {
        let request = self.bot.send_message(ChatId(chat_id), text);
        let result = match format.as_parse_mode() {
            Some(parse_mode) => request.parse_mode(parse_mode).await,
            None => request.await,
        };
        result.map(|_| ()).map_err(|e| classify(&e))
    }

    async fn send_typing(&self, chat_id: i64) -> Result<(), SendError> {
        self.bot
            .send_chat_action(ChatId(chat_id), ChatAction::Typing)
            .await
            .map(|_| ())
            .map_err(|e| classify(&e))
    }
}

/// Map a teloxide error onto the retry classification.
pub fn classify(error: &RequestError) -> SendError {
    let reason = error.to_string();
    match error {
        RequestError::Api(ApiError::CantParseEntities(_)) => SendError::MarkupRejected(reason),
        RequestError::Api(ApiError::Unknown(text)) if is_markup_error(text) => {
            SendError::MarkupRejected(reason)
        }
        RequestError::RetryAfter(_)
        | RequestError::Network(_)
        | RequestError::Io(_)
        | RequestError::InvalidJson { .. } => SendError::Transient(reason),
        _ => SendError::Permanent(reason),
    }
}

fn is_markup_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("can't parse entities") || lower.contains("can't find end of")
}
