//! Delivery of a model response as one or more chat messages.
//!
//! Each part runs through a small state machine driven by the typed
//! [`SendError`] the transport reports:
//!
//! ```text
//! Pending -> Sending -> Delivered
//!                    -> Retrying -> Sending      (Transient, attempts left)
//!                    -> Degraded -> Delivered    (MarkupRejected, plain resend)
//!                    -> Failed                   (Permanent, retries exhausted)
//! ```

use std::sync::Arc;
use std::time::Duration;

use super::transport::{ChatTransport, SendError};
use crate::config::TelegramConfig;
use crate::formatter::{
    create_formatter, is_balanced, strip_markup, MessageFormat, MessagePart, MessageSplitter,
};

/// Sent instead of a response whose first part could not be delivered.
pub const DISPLAY_FAILURE_NOTICE: &str =
    "I received a response but couldn't display it properly. Please try again.";

/// Retry bounds and pacing for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per part in `Sending`, including the first.
    pub max_attempts: u32,
    /// Delay before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
    /// Pause between consecutive parts.
    pub part_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            part_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TelegramConfig) -> Self {
        Self {
            max_attempts: config.max_send_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            part_delay: Duration::from_millis(config.part_delay_ms),
        }
    }
}

/// Terminal result for one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    Delivered,
    /// Delivered as plain text after the markup was rejected.
    DeliveredPlain,
    Failed,
}

#[derive(Debug)]
enum PartState {
    Pending,
    Sending { attempt: u32 },
    Retrying { attempt: u32 },
    Degraded,
    Done(PartOutcome),
}

/// What happened to a whole message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Outcome per attempted part. Shorter than the part count when
    /// delivery stopped early.
    pub outcomes: Vec<PartOutcome>,
    pub total_parts: usize,
    pub notice_sent: bool,
}

impl DeliveryReport {
    pub fn fully_delivered(&self) -> bool {
        self.outcomes.len() == self.total_parts
            && self.outcomes.iter().all(|o| *o != PartOutcome::Failed)
    }
}

/// Formats, splits and sends messages through a [`ChatTransport`].
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn ChatTransport>,
    policy: RetryPolicy,
    format: MessageFormat,
    max_part_size: usize,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        policy: RetryPolicy,
        format: MessageFormat,
        max_part_size: usize,
    ) -> Self {
        Self {
            transport,
            policy,
            format,
            max_part_size,
        }
    }

    pub fn transport(&self) -> &Arc<dyn ChatTransport> {
        &self.transport
    }

    /// Deliver model output: translate it to the configured markup, split it,
    /// and send every part. If the first part cannot be delivered the user
    /// gets [`DISPLAY_FAILURE_NOTICE`] and the rest is dropped.
    pub async fn send_formatted(&self, chat_id: i64, raw: &str, request_id: &str) -> DeliveryReport {
        let formatter = create_formatter(self.format);
        let (text, format) = match formatter.format(raw) {
            Ok(text) => (text, self.format),
            Err(e) => {
                tracing::warn!(
                    component = "dispatch",
                    request_id = %request_id,
                    error = %e,
                    "Formatting failed, using plain text"
                );
                (raw.to_string(), MessageFormat::Plain)
            }
        };
        let splitter = MessageSplitter::new(
            self.max_part_size,
            format == self.format && formatter.supports_markup_repair(),
        );
        let parts = splitter.split(&text);
        self.deliver(chat_id, &parts, format, true, request_id).await
    }

    /// Deliver a bot reply as plain text, split if it is long.
    pub async fn send_plain(&self, chat_id: i64, text: &str, request_id: &str) -> DeliveryReport {
        let parts = MessageSplitter::new(self.max_part_size, false).split(text);
        self.deliver(chat_id, &parts, MessageFormat::Plain, false, request_id)
            .await
    }

    async fn deliver(
        &self,
        chat_id: i64,
        parts: &[MessagePart],
        format: MessageFormat,
        notify_on_failure: bool,
        request_id: &str,
    ) -> DeliveryReport {
        let mut report = DeliveryReport {
            total_parts: parts.len(),
            ..Default::default()
        };
        if parts.len() > 1 {
            tracing::info!(
                component = "dispatch",
                request_id = %request_id,
                chat_id = chat_id,
                parts = parts.len(),
                "Message too long, sending in parts"
            );
        }

        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.policy.part_delay).await;
            }
            let rendered = part.render(format);
            if format == MessageFormat::Html && !is_balanced(&rendered) {
                tracing::warn!(
                    component = "dispatch",
                    request_id = %request_id,
                    part = i + 1,
                    "Part has unbalanced markup"
                );
            }
            let outcome = self.send_part(chat_id, &rendered, format, part, request_id).await;
            report.outcomes.push(outcome);

            if outcome != PartOutcome::Failed {
                continue;
            }
            tracing::error!(
                component = "dispatch",
                request_id = %request_id,
                chat_id = chat_id,
                part = part.index,
                total = part.total,
                "Failed to send part after all attempts"
            );
            if i == 0 {
                if notify_on_failure {
                    report.notice_sent = self.send_notice(chat_id, request_id).await;
                }
                break;
            }
        }

        report
    }

    async fn send_part(
        &self,
        chat_id: i64,
        text: &str,
        format: MessageFormat,
        part: &MessagePart,
        request_id: &str,
    ) -> PartOutcome {
        let mut state = PartState::Pending;
        loop {
            state = match state {
                PartState::Pending => PartState::Sending { attempt: 1 },
                PartState::Sending { attempt } => {
                    match self.transport.send_text(chat_id, text, format).await {
                        Ok(()) => PartState::Done(PartOutcome::Delivered),
                        Err(e) => {
                            tracing::warn!(
                                component = "dispatch",
                                request_id = %request_id,
                                chat_id = chat_id,
                                part = part.index,
                                total = part.total,
                                attempt = attempt,
                                max_attempts = self.policy.max_attempts,
                                error = %e,
                                "Send attempt failed"
                            );
                            self.next_state(e, attempt, format)
                        }
                    }
                }
                PartState::Retrying { attempt } => {
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                    PartState::Sending {
                        attempt: attempt + 1,
                    }
                }
                PartState::Degraded => {
                    tracing::info!(
                        component = "dispatch",
                        request_id = %request_id,
                        part = part.index,
                        "Markup rejected, resending as plain text"
                    );
                    let plain = strip_markup(text);
                    match self
                        .transport
                        .send_text(chat_id, &plain, MessageFormat::Plain)
                        .await
                    {
                        Ok(()) => PartState::Done(PartOutcome::DeliveredPlain),
                        Err(e) => {
                            tracing::error!(
                                component = "dispatch",
                                request_id = %request_id,
                                part = part.index,
                                error = %e,
                                "Plain text resend failed"
                            );
                            PartState::Done(PartOutcome::Failed)
                        }
                    }
                }
                PartState::Done(outcome) => return outcome,
            };
        }
    }

    fn next_state(&self, error: SendError, attempt: u32, format: MessageFormat) -> PartState {
        match error {
            SendError::MarkupRejected(_) if format != MessageFormat::Plain => PartState::Degraded,
            SendError::Transient(_) if attempt < self.policy.max_attempts => {
                PartState::Retrying { attempt }
            }
            _ => PartState::Done(PartOutcome::Failed),
        }
    }

    async fn send_notice(&self, chat_id: i64, request_id: &str) -> bool {
        match self
            .transport
            .send_text(chat_id, DISPLAY_FAILURE_NOTICE, MessageFormat::Plain)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    component = "dispatch",
                    request_id = %request_id,
                    chat_id = chat_id,
                    error = %e,
                    "Failed to send fallback notice"
                );
                false
            }
        }
    }
}
