mod balance;
mod entities;
mod html;
mod plain;
mod splitter;
mod table;

pub use balance::is_balanced;
pub use html::HtmlFormatter;
pub use plain::PlainFormatter;
pub use splitter::{MessagePart, MessageSplitter};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Supported message formats for Telegram
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Telegram HTML subset (default)
    #[default]
    Html,
    /// Plain text (no formatting)
    Plain,
}

impl MessageFormat {
    /// Returns the teloxide ParseMode if applicable
    pub fn as_parse_mode(&self) -> Option<teloxide::types::ParseMode> {
        match self {
            Self::Html => Some(teloxide::types::ParseMode::Html),
            Self::Plain => None,
        }
    }
}

/// Trait for message formatters
pub trait Formatter: Send + Sync {
    /// Format text for the target platform
    fn format(&self, text: &str) -> Result<String>;

    /// Whether split parts need their markup closed and reopened
    fn supports_markup_repair(&self) -> bool {
        false
    }
}

/// Create a formatter for the given message format
pub fn create_formatter(format: MessageFormat) -> Box<dyn Formatter> {
    match format {
        MessageFormat::Html => Box::new(HtmlFormatter),
        MessageFormat::Plain => Box::new(PlainFormatter),
    }
}

/// Decode raw bytes as UTF-8, replacing invalid sequences with U+FFFD.
pub fn normalize_encoding(raw: &[u8]) -> Cow<'_, str> {
    let text = String::from_utf8_lossy(raw);
    if text.contains("\r\n") {
        Cow::Owned(text.replace("\r\n", "\n"))
    } else {
        text
    }
}

/// Plain-text projection of HTML: tags removed, entities decoded.
pub fn strip_markup(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(lt) = rest.find('<') {
        result.push_str(&rest[..lt]);
        match rest[lt..].find('>') {
            Some(gt) => rest = &rest[lt + gt + 1..],
            None => {
                rest = &rest[lt..];
                break;
            }
        }
    }
    result.push_str(rest);
    entities::decode_entities(&result)
}
