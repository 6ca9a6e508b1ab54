//! OpenRouter API client for chat completions and credit balance.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::OpenRouterConfig;
use crate::formatter::normalize_encoding;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("OpenRouter API token is not set")]
    MissingToken,

    #[error("request to AI service timed out (after {0:?}). Please try again")]
    Timeout(Duration),

    #[error("request to AI service failed: {0}")]
    Request(String),

    #[error("API returned error status: {0}")]
    Status(u16),

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("no response received from the model")]
    EmptyResponse,
}

/// Account balance reported by `GET /credits`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Credits {
    #[serde(default)]
    pub credits: f64,
    #[serde(default)]
    pub usage: f64,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

/// Source of model completions.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        api_token: &str,
        model_id: &str,
        prompt: &str,
        request_id: &str,
    ) -> Result<String, CompletionError>;

    async fn credits(&self, api_token: &str, request_id: &str) -> Result<Credits, CompletionError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

/// OpenRouter API client.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    base_url: String,
    referer: String,
    title: String,
    timeout: Duration,
}

impl OpenRouterClient {
    pub fn new(config: &OpenRouterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            referer: config.referer.clone(),
            title: config.title.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    fn request(
        &self,
        builder: reqwest::RequestBuilder,
        api_token: &str,
        request_id: &str,
    ) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", api_token))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .header("X-Request-ID", request_id)
            .timeout(self.timeout)
    }

    /// Send a request and return the body of a 200 response, decoded
    /// lossily so stray invalid UTF-8 never fails the request.
    async fn fetch(
        &self,
        builder: reqwest::RequestBuilder,
        request_id: &str,
    ) -> Result<String, CompletionError> {
        let started = Instant::now();
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout(started.elapsed())
            } else {
                CompletionError::Request(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                CompletionError::Timeout(started.elapsed())
            } else {
                CompletionError::Request(format!("failed to read response: {e}"))
            }
        })?;

        tracing::info!(
            component = "openrouter",
            request_id = %request_id,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "OpenRouter responded"
        );

        if !status.is_success() {
            tracing::error!(
                component = "openrouter",
                request_id = %request_id,
                status = status.as_u16(),
                body = %String::from_utf8_lossy(&body),
                "OpenRouter returned non-OK status"
            );
            return Err(CompletionError::Status(status.as_u16()));
        }
        Ok(normalize_encoding(&body).into_owned())
    }
}

#[async_trait]
impl CompletionBackend for OpenRouterClient {
    async fn complete(
        &self,
        api_token: &str,
        model_id: &str,
        prompt: &str,
        request_id: &str,
    ) -> Result<String, CompletionError> {
        if api_token.is_empty() {
            return Err(CompletionError::MissingToken);
        }

        let request = ChatRequest {
            model: model_id,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        tracing::debug!(
            component = "openrouter",
            request_id = %request_id,
            model = %model_id,
            prompt_len = prompt.len(),
            "Sending chat request"
        );

        let url = format!("{}/chat/completions", self.base_url);
        let builder = self.request(self.client.post(url).json(&request), api_token, request_id);
        let body = self.fetch(builder, request_id).await?;

        let response: ChatResponse =
            serde_json::from_str(&body).map_err(|e| CompletionError::Parse(e.to_string()))?;
        if let Some(error) = response.error {
            return Err(CompletionError::Api(error.message));
        }

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(CompletionError::EmptyResponse)?;

        tracing::debug!(
            component = "openrouter",
            request_id = %request_id,
            response_len = content.len(),
            "Received completion"
        );
        Ok(content.replace("\r\n", "\n"))
    }

    async fn credits(&self, api_token: &str, request_id: &str) -> Result<Credits, CompletionError> {
        if api_token.is_empty() {
            return Err(CompletionError::MissingToken);
        }

        let url = format!("{}/credits", self.base_url);
        let builder = self.request(self.client.get(url), api_token, request_id);
        let body = self.fetch(builder, request_id).await?;

        let credits: Credits =
            serde_json::from_str(&body).map_err(|e| CompletionError::Parse(e.to_string()))?;
        if let Some(ref error) = credits.error {
            return Err(CompletionError::Api(error.message.clone()));
        }
        Ok(credits)
    }
}

/// Names models like to prefix their answers with.
const MODEL_PREFIXES: &[&str] = &[
    "assistant", "ai", "bot", "chatgpt", "gpt", "claude", "qwen", "mistral", "llama",
];

/// Remove a leading speaker label such as `Assistant:` from a response.
///
/// `name:` is always removed. A bare `name` is removed only when it stands on
/// its own line, so answers that merely start with the word survive.
pub fn strip_model_prefix(text: &str) -> String {
    let trimmed = text.trim();
    for prefix in MODEL_PREFIXES {
        let Some(head) = trimmed.get(..prefix.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(prefix) {
            continue;
        }
        let rest = &trimmed[prefix.len()..];
        if let Some(after_colon) = rest.strip_prefix(':') {
            return after_colon.trim().to_string();
        }
        if rest.starts_with('\n') {
            return rest.trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Credits summary as shown in chat.
pub fn format_credits(credits: &Credits) -> String {
    let mut result = String::from("🪙 OpenRouter Credits Information:\n\n");
    result.push_str(&format!("• Remaining credits: {:.2}\n", credits.credits));
    result.push_str(&format!("• Usage: {:.2}\n", credits.usage));
    if let Some(expires_at) = credits.expires_at.as_deref().filter(|s| !s.is_empty()) {
        result.push_str(&format!("• Expires at: {}\n", format_expiry(expires_at)));
    }
    result.push_str("\nView more details at: https://openrouter.ai/account");
    result
}

/// RFC 3339 timestamps are shown in UTC, anything else as received.
fn format_expiry(raw: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc).format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> OpenRouterClient {
        OpenRouterClient::new(&OpenRouterConfig {
            base_url: server.uri(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_complete_sends_model_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(header("HTTP-Referer", "https://t.me/openrouter_bot"))
            .and(header("X-Title", "Telegram OpenRouter Bot"))
            .and(header("X-Request-ID", "req-1"))
            .and(body_json(serde_json::json!({
                "model": "openai/gpt-4",
                "messages": [{"role": "user", "content": "hi"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "gen-1",
                "choices": [{"message": {"role": "assistant", "content": "Hello\r\nthere"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = client(&server)
            .complete("sk-test", "openai/gpt-4", "hi", "req-1")
            .await
            .unwrap();
        assert_eq!(reply, "Hello\nthere");
    }

    #[tokio::test]
    async fn test_api_error_in_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"message": "model not found"}
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .complete("sk-test", "nope/nope", "hi", "req")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "API error: model not found");
    }

    #[tokio::test]
    async fn test_empty_choices_and_bad_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("X-Request-ID", "empty"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("X-Request-ID", "limited"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("X-Request-ID", "blank"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": " \n\t"}}]
            })))
            .mount(&server)
            .await;

        let client = client(&server);
        let err = client.complete("sk", "m", "hi", "empty").await.unwrap_err();
        assert!(matches!(err, CompletionError::EmptyResponse));

        let err = client.complete("sk", "m", "hi", "blank").await.unwrap_err();
        assert!(matches!(err, CompletionError::EmptyResponse));

        let err = client.complete("sk", "m", "hi", "limited").await.unwrap_err();
        assert!(matches!(err, CompletionError::Status(429)));
        assert_eq!(err.to_string(), "API returned error status: 429");
    }

    #[tokio::test]
    async fn test_unparsable_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client(&server)
            .complete("sk", "m", "hi", "req")
            .await
            .unwrap_err();
        assert!(matches!(err, CompletionError::Parse(_)));
    }

    #[tokio::test]
    async fn test_missing_token_makes_no_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server).complete("", "m", "hi", "req").await.unwrap_err();
        assert!(matches!(err, CompletionError::MissingToken));
    }

    #[tokio::test]
    async fn test_credits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/credits"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "credits": 12.5,
                "usage": 0.256,
                "expires_at": "2026-12-31"
            })))
            .mount(&server)
            .await;

        let credits = client(&server).credits("sk-test", "req").await.unwrap();
        assert_eq!(credits.credits, 12.5);
        assert_eq!(
            format_credits(&credits),
            "🪙 OpenRouter Credits Information:\n\n\
             • Remaining credits: 12.50\n\
             • Usage: 0.26\n\
             • Expires at: 2026-12-31\n\
             \nView more details at: https://openrouter.ai/account"
        );
    }

    #[tokio::test]
    async fn test_credits_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/credits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": {"message": "invalid key"}
            })))
            .mount(&server)
            .await;

        let err = client(&server).credits("sk", "req").await.unwrap_err();
        assert_eq!(err.to_string(), "API error: invalid key");
    }

    #[test]
    fn test_strip_model_prefix() {
        assert_eq!(strip_model_prefix("Assistant: Hello"), "Hello");
        assert_eq!(strip_model_prefix("  claude:\nHi there "), "Hi there");
        assert_eq!(strip_model_prefix("GPT\nAnswer"), "Answer");
        assert_eq!(strip_model_prefix("AI is a broad field."), "AI is a broad field.");
        assert_eq!(strip_model_prefix("Botany is fun"), "Botany is fun");
        assert_eq!(strip_model_prefix("Plain answer"), "Plain answer");
        assert_eq!(strip_model_prefix("ñ"), "ñ");
    }

    #[test]
    fn test_format_expiry() {
        assert_eq!(format_expiry("2026-03-01T10:30:00+02:00"), "2026-03-01 08:30 UTC");
        assert_eq!(format_expiry("next year"), "next year");
    }

    #[test]
    fn test_format_credits_without_expiry() {
        let credits = Credits {
            credits: 1.0,
            usage: 0.0,
            expires_at: None,
            error: None,
        };
        assert!(!format_credits(&credits).contains("Expires"));
    }
}
