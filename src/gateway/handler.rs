use anyhow::Result;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use super::commands::{self, Command, Parsed, HELP_TEXT};
use super::dispatch::Dispatcher;
use super::transport::ChatTransport;
use crate::logging::LogLevelHandle;
use crate::openrouter::{format_credits, strip_model_prefix, CompletionBackend, CompletionError};
use crate::store::{SettingsStore, UserSettings};

const AUTH_OK: &str = "✅ Authorization successful! You can now use the bot.";
const AUTH_REQUIRED: &str =
    "⚠️ This bot is password protected. Please enter the password to continue.";
const SET_TOKEN_FIRST: &str =
    "Please set your OpenRouter API token first with /settoken <your_token>";
const MODELS_URL: &str = "https://openrouter.ai/models?order=top-weekly";
pub const TIMEOUT_NOTICE: &str = "Sorry, the operation timed out. Please try again.";

/// One incoming chat message, stripped of transport details.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: Option<String>,
}

/// Handles messages for one bot: authorization, commands and chat.
pub struct ChatHandler {
    store: Arc<SettingsStore>,
    backend: Arc<dyn CompletionBackend>,
    dispatcher: Dispatcher,
    password: String,
    bot_name: String,
    log_level: LogLevelHandle,
}

impl ChatHandler {
    pub fn new(
        store: Arc<SettingsStore>,
        backend: Arc<dyn CompletionBackend>,
        dispatcher: Dispatcher,
        password: String,
        bot_name: String,
        log_level: LogLevelHandle,
    ) -> Self {
        Self {
            store,
            backend,
            dispatcher,
            password,
            bot_name,
            log_level,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn handle(&self, msg: &IncomingMessage, request_id: &str, deadline: Instant) -> Result<()> {
        if Instant::now() >= deadline {
            tracing::error!(
                component = "handler",
                request_id = %request_id,
                "Deadline passed before message handling"
            );
            self.reply(msg.chat_id, TIMEOUT_NOTICE, request_id).await;
            return Ok(());
        }

        if !self.authorize(msg, request_id).await? {
            return Ok(());
        }

        let user = self.store.user(msg.user_id).await?;

        let Some(text) = msg.text.as_deref() else {
            self.reply(msg.chat_id, "Please send a text message.", request_id)
                .await;
            return Ok(());
        };

        match commands::parse(text, &self.bot_name) {
            Parsed::Command(command) => {
                tracing::info!(
                    component = "handler",
                    request_id = %request_id,
                    user_id = msg.user_id,
                    command = %text.split_whitespace().next().unwrap_or_default(),
                    "Received command"
                );
                self.handle_command(msg, user, command, request_id).await
            }
            Parsed::Unknown => {
                self.reply(
                    msg.chat_id,
                    "Unknown command. Use /help to see available commands.",
                    request_id,
                )
                .await;
                Ok(())
            }
            Parsed::Text => {
                self.handle_chat(msg.chat_id, &user, text, request_id, deadline)
                    .await;
                Ok(())
            }
        }
    }

    /// Returns true when the sender may use the bot. A correct password
    /// authorizes the sender and is consumed.
    async fn authorize(&self, msg: &IncomingMessage, request_id: &str) -> Result<bool> {
        if self.store.is_authorized(msg.user_id).await {
            tracing::debug!(component = "handler", request_id = %request_id, user_id = msg.user_id, "User already authorized");
            return Ok(true);
        }

        if msg.text.as_deref() == Some(self.password.as_str()) {
            self.store.authorize(msg.user_id).await?;
            tracing::info!(component = "handler", request_id = %request_id, user_id = msg.user_id, "User authorized with password");
            self.reply(msg.chat_id, AUTH_OK, request_id).await;
        } else {
            tracing::info!(component = "handler", request_id = %request_id, user_id = msg.user_id, "Unauthorized access attempt");
            self.reply(msg.chat_id, AUTH_REQUIRED, request_id).await;
        }
        Ok(false)
    }

    async fn handle_command(
        &self,
        msg: &IncomingMessage,
        user: UserSettings,
        command: Command,
        request_id: &str,
    ) -> Result<()> {
        let chat_id = msg.chat_id;
        let user_id = msg.user_id;

        let reply = match command {
            Command::Start | Command::Help => HELP_TEXT.to_string(),
            Command::SetToken(token) => {
                let token = token.trim().to_string();
                if token.is_empty() {
                    "Please provide your OpenRouter API token. Usage: /settoken <your_token>"
                        .to_string()
                } else {
                    self.store
                        .update_user(user_id, |u| u.openrouter_token = token)
                        .await?;
                    "OpenRouter API token has been set! You can now chat with AI models."
                        .to_string()
                }
            }
            Command::Model => {
                if user.current_model.is_empty() {
                    "No model selected. Use /setmodel <name> to select a model.".to_string()
                } else {
                    format!(
                        "Current model: {} ({})",
                        user.current_model,
                        user.current_model_id().unwrap_or_default()
                    )
                }
            }
            Command::Models => {
                if user.models.is_empty() {
                    "No models available. Use /addmodel to add some.".to_string()
                } else {
                    let list: String = user
                        .models
                        .iter()
                        .map(|(name, id)| format!("• {} ({})\n", name, id))
                        .collect();
                    format!(
                        "Available models:\n{}\nUse /setmodel <name> to select a model.\nFull model list (for looking up ids): {}",
                        list, MODELS_URL
                    )
                }
            }
            Command::SetModel(name) => {
                let name = name.trim().to_string();
                match user.models.get(&name) {
                    _ if name.is_empty() => {
                        "Please provide a model name. Usage: /setmodel <model_name>".to_string()
                    }
                    None => format!(
                        "Model '{}' not found. Use /models to see available models.",
                        name
                    ),
                    Some(id) => {
                        let reply = format!("Model set to: {} ({})", name, id);
                        self.store
                            .update_user(user_id, |u| u.current_model = name)
                            .await?;
                        reply
                    }
                }
            }
            Command::AddModel(args) => match commands::split_model_args(&args) {
                None => "Please provide model name and ID. Usage: /addmodel <your_name> <openrouter_id>"
                    .to_string(),
                Some((name, id)) => {
                    self.store
                        .update_user(user_id, |u| {
                            u.models.insert(name.to_string(), id.to_string());
                        })
                        .await?;
                    format!("Model added: {} ({})", name, id)
                }
            },
            Command::RemoveModel(name) => {
                let name = name.trim().to_string();
                if name.is_empty() {
                    "Please provide a model name. Usage: /removemodel <name>".to_string()
                } else if !user.models.contains_key(&name) {
                    format!("Model '{}' not found.", name)
                } else {
                    let reply = format!("Model '{}' removed.", name);
                    self.store
                        .update_user(user_id, |u| {
                            if u.current_model == name {
                                u.current_model.clear();
                            }
                            u.models.remove(&name);
                        })
                        .await?;
                    reply
                }
            }
            Command::Debug => {
                let level = self.store.toggle_debug().await?;
                self.log_level.apply(level)?;
                tracing::info!(component = "handler", request_id = %request_id, level = %level, "Log level changed");
                if level == crate::logging::LogLevel::Debug {
                    "Debug mode enabled. Check logs for detailed information.".to_string()
                } else {
                    "Debug mode disabled.".to_string()
                }
            }
            Command::GetCredits => {
                if user.openrouter_token.is_empty() {
                    SET_TOKEN_FIRST.to_string()
                } else {
                    self.send_typing(chat_id, request_id).await;
                    match self.backend.credits(&user.openrouter_token, request_id).await {
                        Ok(credits) => format_credits(&credits),
                        Err(e) => {
                            tracing::error!(component = "handler", request_id = %request_id, error = %e, "Failed to get credits");
                            format!("Error getting credits: {}", e)
                        }
                    }
                }
            }
        };

        self.reply(chat_id, &reply, request_id).await;
        Ok(())
    }

    async fn handle_chat(
        &self,
        chat_id: i64,
        user: &UserSettings,
        text: &str,
        request_id: &str,
        deadline: Instant,
    ) {
        if user.openrouter_token.is_empty() {
            self.reply(chat_id, SET_TOKEN_FIRST, request_id).await;
            return;
        }
        let Some(model_id) = user.current_model_id() else {
            self.reply(
                chat_id,
                "Please select a model first with /setmodel <model_name>",
                request_id,
            )
            .await;
            return;
        };

        if Instant::now() >= deadline {
            tracing::error!(component = "handler", request_id = %request_id, "Deadline passed before API call");
            self.reply(chat_id, TIMEOUT_NOTICE, request_id).await;
            return;
        }

        tracing::info!(
            component = "handler",
            request_id = %request_id,
            model = %user.current_model,
            query_len = text.chars().count(),
            "Sending query to OpenRouter"
        );

        let typing = TypingIndicator::start(self.dispatcher.transport().clone(), chat_id);
        let result = self
            .backend
            .complete(&user.openrouter_token, model_id, text, request_id)
            .await;
        drop(typing);

        match result {
            Ok(response) => {
                tracing::info!(
                    component = "handler",
                    request_id = %request_id,
                    response_len = response.chars().count(),
                    "Received response from OpenRouter"
                );
                let cleaned = strip_model_prefix(&response);
                if cleaned.trim().is_empty() {
                    let e = CompletionError::EmptyResponse;
                    tracing::error!(component = "handler", request_id = %request_id, error = %e, "Response is empty after cleanup");
                    self.reply(chat_id, &format!("Error: {}", e), request_id)
                        .await;
                    return;
                }
                let report = self
                    .dispatcher
                    .send_formatted(chat_id, &cleaned, request_id)
                    .await;
                if !report.fully_delivered() {
                    tracing::warn!(
                        component = "handler",
                        request_id = %request_id,
                        delivered = report.outcomes.len(),
                        total = report.total_parts,
                        "Response was not fully delivered"
                    );
                }
            }
            Err(e) => {
                tracing::error!(component = "handler", request_id = %request_id, error = %e, "API request failed");
                self.reply(chat_id, &format!("Error: {}", e), request_id)
                    .await;
            }
        }
    }

    async fn send_typing(&self, chat_id: i64, request_id: &str) {
        if let Err(e) = self.dispatcher.transport().send_typing(chat_id).await {
            tracing::debug!(component = "handler", request_id = %request_id, error = %e, "Failed to send typing action");
        }
    }

    async fn reply(&self, chat_id: i64, text: &str, request_id: &str) {
        let report = self.dispatcher.send_plain(chat_id, text, request_id).await;
        if !report.fully_delivered() {
            tracing::error!(component = "handler", request_id = %request_id, chat_id = chat_id, "Failed to send reply");
        }
    }
}

/// Re-sends the typing action every few seconds until dropped. Dropping
/// also happens when the handler is cancelled by its deadline.
struct TypingIndicator(tokio::task::JoinHandle<()>);

impl TypingIndicator {
    fn start(transport: Arc<dyn ChatTransport>, chat_id: i64) -> Self {
        Self(tokio::spawn(async move {
            loop {
                let _ = transport.send_typing(chat_id).await;
                tokio::time::sleep(Duration::from_secs(4)).await;
            }
        }))
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenRouterConfig;
    use crate::formatter::MessageFormat;
    use crate::gateway::dispatch::tests::MockTransport;
    use crate::gateway::dispatch::RetryPolicy;
    use crate::openrouter::{CompletionError, Credits};
    use async_trait::async_trait;
    use std::sync::Mutex;

    const PASSWORD: &str = "open sesame";

    #[derive(Default)]
    struct FakeBackend {
        reply: Option<String>,
        calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl CompletionBackend for FakeBackend {
        async fn complete(
            &self,
            api_token: &str,
            model_id: &str,
            prompt: &str,
            _request_id: &str,
        ) -> Result<String, CompletionError> {
            self.calls.lock().unwrap().push((
                api_token.to_string(),
                model_id.to_string(),
                prompt.to_string(),
            ));
            self.reply.clone().ok_or(CompletionError::Status(502))
        }

        async fn credits(
            &self,
            _api_token: &str,
            _request_id: &str,
        ) -> Result<Credits, CompletionError> {
            Err(CompletionError::Api("invalid key".into()))
        }
    }

    struct Harness {
        handler: ChatHandler,
        transport: Arc<MockTransport>,
        backend: Arc<FakeBackend>,
        store: Arc<SettingsStore>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(reply: Option<&str>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(
                SettingsStore::open(dir.path().join("bot_config.json"), &OpenRouterConfig::default())
                    .unwrap(),
            );
            let transport = MockTransport::scripted(vec![]);
            let backend = Arc::new(FakeBackend {
                reply: reply.map(str::to_string),
                ..Default::default()
            });
            let policy = RetryPolicy {
                max_attempts: 3,
                backoff: Duration::ZERO,
                part_delay: Duration::ZERO,
            };
            let dispatcher = Dispatcher::new(transport.clone(), policy, MessageFormat::Html, 4000);
            let handler = ChatHandler::new(
                store.clone(),
                backend.clone(),
                dispatcher,
                PASSWORD.to_string(),
                "orbot".to_string(),
                LogLevelHandle::detached(),
            );
            Self {
                handler,
                transport,
                backend,
                store,
                _dir: dir,
            }
        }

        async fn send(&self, text: &str) -> Vec<String> {
            let before = self.transport.sent().len();
            let msg = IncomingMessage {
                chat_id: 10,
                user_id: 20,
                text: Some(text.to_string()),
            };
            let deadline = Instant::now() + Duration::from_secs(180);
            self.handler.handle(&msg, "req", deadline).await.unwrap();
            self.transport.texts()[before..].to_vec()
        }

        async fn authorized(reply: Option<&str>) -> Self {
            let harness = Self::new(reply);
            harness.store.authorize(20).await.unwrap();
            harness
        }
    }

    #[tokio::test]
    async fn test_unauthorized_user_is_asked_for_password() {
        let h = Harness::new(Some("hi"));
        assert_eq!(h.send("hello").await, vec![AUTH_REQUIRED]);
        assert!(!h.store.is_authorized(20).await);
        assert!(h.backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_password_authorizes_and_is_not_forwarded() {
        let h = Harness::new(Some("hi"));
        assert_eq!(h.send(PASSWORD).await, vec![AUTH_OK]);
        assert!(h.store.is_authorized(20).await);
        assert!(h.backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chat_uses_selected_model_and_formats_reply() {
        let h = Harness::authorized(Some("Assistant: **Sure**, try `ls -la`")).await;
        h.store
            .update_user(20, |u| u.openrouter_token = "sk-or".into())
            .await
            .unwrap();

        let replies = h.send("how do I list files?").await;
        assert_eq!(replies, vec!["<b>Sure</b>, try <code>ls -la</code>"]);
        let calls = h.backend.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![(
                "sk-or".to_string(),
                "openai/gpt-3.5-turbo".to_string(),
                "how do I list files?".to_string()
            )]
        );
        assert_eq!(h.transport.sent()[0].format, MessageFormat::Html);
    }

    #[tokio::test]
    async fn test_chat_requires_token_and_model() {
        let h = Harness::authorized(Some("hi")).await;
        assert_eq!(h.send("hello").await, vec![SET_TOKEN_FIRST]);

        h.store
            .update_user(20, |u| {
                u.openrouter_token = "sk".into();
                u.current_model.clear();
            })
            .await
            .unwrap();
        assert_eq!(
            h.send("hello").await,
            vec!["Please select a model first with /setmodel <model_name>"]
        );
    }

    #[tokio::test]
    async fn test_backend_error_is_reported() {
        let h = Harness::authorized(None).await;
        h.store
            .update_user(20, |u| u.openrouter_token = "sk".into())
            .await
            .unwrap();
        assert_eq!(
            h.send("hello").await,
            vec!["Error: API returned error status: 502"]
        );
    }

    #[tokio::test]
    async fn test_model_commands() {
        let h = Harness::authorized(None).await;

        assert_eq!(
            h.send("/setmodel gpt-4").await,
            vec!["Model set to: gpt-4 (openai/gpt-4)"]
        );
        assert_eq!(
            h.send("/model").await,
            vec!["Current model: gpt-4 (openai/gpt-4)"]
        );
        assert_eq!(
            h.send("/setmodel nope").await,
            vec!["Model 'nope' not found. Use /models to see available models."]
        );
        assert_eq!(
            h.send("/addmodel fast openai/gpt-4o-mini").await,
            vec!["Model added: fast (openai/gpt-4o-mini)"]
        );
        assert_eq!(
            h.send("/addmodel onlyname").await,
            vec!["Please provide model name and ID. Usage: /addmodel <your_name> <openrouter_id>"]
        );
        assert_eq!(h.send("/removemodel gpt-4").await, vec!["Model 'gpt-4' removed."]);
        assert_eq!(
            h.send("/model").await,
            vec!["No model selected. Use /setmodel <name> to select a model."]
        );

        let user = h.store.user(20).await.unwrap();
        assert_eq!(user.models["fast"], "openai/gpt-4o-mini");
        assert!(!user.models.contains_key("gpt-4"));

        let models = h.send("/models").await;
        assert!(models[0].starts_with("Available models:\n• claude-2 (anthropic/claude-2)\n"));
        assert!(models[0].contains("• fast (openai/gpt-4o-mini)\n"));
    }

    #[tokio::test]
    async fn test_settoken_help_and_unknown() {
        let h = Harness::authorized(None).await;
        assert_eq!(
            h.send("/settoken sk-or-v1-abc").await,
            vec!["OpenRouter API token has been set! You can now chat with AI models."]
        );
        assert_eq!(h.store.user(20).await.unwrap().openrouter_token, "sk-or-v1-abc");
        assert_eq!(h.send("/help").await, vec![HELP_TEXT]);
        assert_eq!(
            h.send("/frobnicate").await,
            vec!["Unknown command. Use /help to see available commands."]
        );
    }

    #[tokio::test]
    async fn test_debug_toggle_and_credits_error() {
        let h = Harness::authorized(None).await;
        assert_eq!(
            h.send("/debug").await,
            vec!["Debug mode enabled. Check logs for detailed information."]
        );
        assert_eq!(h.send("/debug").await, vec!["Debug mode disabled."]);

        assert_eq!(h.send("/getcredits").await, vec![SET_TOKEN_FIRST]);
        h.store
            .update_user(20, |u| u.openrouter_token = "sk".into())
            .await
            .unwrap();
        assert_eq!(
            h.send("/getcredits").await,
            vec!["Error getting credits: API error: invalid key"]
        );
    }

    #[tokio::test]
    async fn test_expired_deadline_sends_timeout_notice() {
        let h = Harness::authorized(Some("hi")).await;
        h.store
            .update_user(20, |u| u.openrouter_token = "sk".into())
            .await
            .unwrap();
        let msg = IncomingMessage {
            chat_id: 10,
            user_id: 20,
            text: Some("hello".into()),
        };
        h.handler.handle(&msg, "req", Instant::now()).await.unwrap();
        assert_eq!(h.transport.texts(), vec![TIMEOUT_NOTICE]);
        assert!(h.backend.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_blank_reply_is_reported_not_sent() {
        for reply in ["Assistant:   ", "", " \n "] {
            let h = Harness::authorized(Some(reply)).await;
            h.store
                .update_user(20, |u| u.openrouter_token = "sk".into())
                .await
                .unwrap();
            assert_eq!(
                h.send("hello").await,
                vec!["Error: no response received from the model"],
                "reply {reply:?}"
            );
        }
    }
}
