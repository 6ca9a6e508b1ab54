use anyhow::Result;

use super::Formatter;

/// Plain text formatter - passes text through, only normalizing line endings
pub struct PlainFormatter;

impl Formatter for PlainFormatter {
    fn format(&self, text: &str) -> Result<String> {
        Ok(text.replace("\r\n", "\n"))
    }
}
