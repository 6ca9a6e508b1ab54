use super::balance::{self, OpenTag};
use super::MessageFormat;

/// One sendable chunk of a longer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    /// 1-based position.
    pub index: usize,
    pub total: usize,
    /// The exact slice of the source text this part covers.
    pub body: String,
    /// `body` with tags reopened at the start and closed at the end, so the
    /// part is well-formed on its own.
    pub text: String,
}

impl MessagePart {
    /// Header shown when a message is sent in several parts.
    pub fn header(&self) -> Option<String> {
        (self.total > 1).then(|| format!("Part {}/{}", self.index, self.total))
    }

    /// Final text to hand to the transport in `format`.
    pub fn render(&self, format: MessageFormat) -> String {
        match (self.header(), format) {
            (None, _) => self.text.clone(),
            (Some(header), MessageFormat::Html) => format!("<b>{header}</b>\n\n{}", self.text),
            (Some(header), MessageFormat::Plain) => format!("{header}\n\n{}", self.text),
        }
    }
}

/// Message splitter that respects Telegram's character limit
/// and keeps HTML parts well-formed
pub struct MessageSplitter {
    max_chars: usize,
    repair_markup: bool,
}

impl MessageSplitter {
    pub fn new(max_chars: usize, repair_markup: bool) -> Self {
        Self {
            max_chars: max_chars.max(1),
            repair_markup,
        }
    }

    /// Split text into parts of at most `max_chars` characters each.
    ///
    /// Text that fits is returned as a single part without a header.
    pub fn split(&self, text: &str) -> Vec<MessagePart> {
        let mut pieces: Vec<(String, String)> = Vec::new();
        let mut carried: Vec<OpenTag> = Vec::new();
        let mut rest = text;

        loop {
            let prefix = balance::reopen(&carried);
            let stack_at_end = self.open_after(rest, &carried);
            let rest_len = char_len(rest);
            let whole_len = rest_len + char_len(&prefix) + closers_len(&stack_at_end);
            // Input that fits is never split, even if repair would overflow it.
            if whole_len <= self.max_chars || (pieces.is_empty() && rest_len <= self.max_chars) {
                let text = format!("{prefix}{rest}{}", balance::close(&stack_at_end));
                pieces.push((rest.to_string(), text));
                break;
            }

            let (cut, stack) = self.cut(rest, &carried);
            let body = &rest[..cut];
            let text = format!("{prefix}{body}{}", balance::close(&stack));
            pieces.push((body.to_string(), text));
            carried = stack;
            rest = &rest[cut..];
            if rest.is_empty() {
                break;
            }
        }

        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(i, (body, text))| MessagePart {
                index: i + 1,
                total,
                body,
                text,
            })
            .collect()
    }

    /// Choose where the current part ends. Returns the byte offset of the cut
    /// and the tags open at that point.
    ///
    /// In HTML mode the budget shrinks until the repaired part fits, with a
    /// floor so every part still makes progress.
    fn cut(&self, rest: &str, carried: &[OpenTag]) -> (usize, Vec<OpenTag>) {
        let prefix_len = char_len(&balance::reopen(carried));
        let floor = (self.max_chars / 4).max(1);
        let mut budget = self.max_chars.saturating_sub(prefix_len).max(floor);

        loop {
            let cut = self.adjust_for_markup(rest, find_split_point(rest, budget));
            let stack = self.open_after(&rest[..cut], carried);
            let overhead = prefix_len + closers_len(&stack);
            let used = char_len(&rest[..cut]) + overhead;
            if used <= self.max_chars || budget <= floor {
                return (cut, stack);
            }
            budget = self
                .max_chars
                .saturating_sub(overhead)
                .clamp(floor, budget - 1);
        }
    }

    /// Move a cut that lands inside a tag or an entity to just before it.
    fn adjust_for_markup(&self, text: &str, cut: usize) -> usize {
        if !self.repair_markup || cut >= text.len() {
            return cut;
        }
        let start = balance::tag_start_containing(text, cut)
            .or_else(|| balance::entity_start_containing(text, cut));
        match start {
            Some(start) if start > 0 => start,
            _ => cut,
        }
    }

    fn open_after(&self, text: &str, carried: &[OpenTag]) -> Vec<OpenTag> {
        if self.repair_markup {
            balance::open_tags_after(text, carried)
        } else {
            Vec::new()
        }
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn closers_len(stack: &[OpenTag]) -> usize {
    char_len(&balance::close(stack))
}

/// Byte offset of the char at `char_idx`, if the text is that long.
fn byte_offset(text: &str, char_idx: usize) -> Option<usize> {
    text.char_indices().nth(char_idx).map(|(b, _)| b)
}

/// Find where to end a part of at most `max_chars` characters.
///
/// Searches the second half of the window for, in order: a blank line, a line
/// break, a sentence end, a space. Falls back to a hard cut at `max_chars`.
/// Returns a byte offset; `text.len()` when the text already fits.
pub fn find_split_point(text: &str, max_chars: usize) -> usize {
    let max_chars = max_chars.max(1);
    let Some(max_byte) = byte_offset(text, max_chars) else {
        return text.len();
    };
    let half_byte = byte_offset(text, max_chars / 2).unwrap_or(0);
    let window = &text[half_byte..max_byte];

    // Priority 1: paragraph boundary
    if let Some(pos) = window.rfind("\n\n") {
        return half_byte + pos + 2;
    }

    // Priority 2: line boundary
    if let Some(pos) = window.rfind('\n') {
        return half_byte + pos + 1;
    }

    // Priority 3: sentence boundary, the space goes with the sentence
    let bytes = window.as_bytes();
    if let Some(pos) = (0..bytes.len().saturating_sub(1))
        .rev()
        .find(|&i| matches!(bytes[i], b'.' | b'?' | b'!') && bytes[i + 1] == b' ')
    {
        return half_byte + pos + 2;
    }

    // Priority 4: word boundary
    if let Some(pos) = window.rfind(' ') {
        return half_byte + pos + 1;
    }

    // Last resort: hard split
    max_byte
}
