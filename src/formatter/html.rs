use anyhow::Result;

use super::balance;
use super::entities::{decode_entities, decode_entity_at, escape_attr, escape_html, push_escaped};
use super::table;
use super::Formatter;

/// Telegram HTML formatter.
/// Converts the Markdown that models usually produce into Telegram's HTML subset.
pub struct HtmlFormatter;

impl Formatter for HtmlFormatter {
    fn format(&self, text: &str) -> Result<String> {
        // The converter only emits paired tags; repair is a no-op unless
        // something upstream smuggled markup in.
        Ok(balance::repair(&markdown_to_html(text)))
    }

    fn supports_markup_repair(&self) -> bool {
        true
    }
}

/// Characters a backslash makes literal.
const ESCAPABLE: &[char] = &['\\', '*', '_', '`', '[', ']'];

/// Convert Markdown to Telegram HTML.
///
/// Block pass over lines (code fences, tables, headers, bullets), then an
/// inline pass over each remaining line (code spans, bold, links, italic,
/// entities). Every span is classified once; nothing is re-read after it has
/// been converted.
pub fn markdown_to_html(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let lines: Vec<&str> = text.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if let Some(fence_len) = opening_fence(line) {
            if let Some(close) = closing_fence(&lines, i + 1, fence_len) {
                let code = lines[i + 1..close].join("\n");
                out.push(format!("<pre>{}</pre>", escape_html(&code)));
                i = close + 1;
                continue;
            }
        }

        if let Some((rendered, consumed)) = table::render_table(&lines[i..]) {
            out.push(rendered);
            i += consumed;
            continue;
        }

        out.push(render_line(line));
        i += 1;
    }

    out.join("\n")
}

/// Backtick count of an opening fence line, if it is one.
fn opening_fence(line: &str) -> Option<usize> {
    let trimmed = line.trim_start();
    let len = trimmed.chars().take_while(|&c| c == '`').count();
    if len < 3 {
        return None;
    }
    // Info strings cannot contain backticks; "```code```" is an inline span.
    if trimmed[len..].contains('`') {
        return None;
    }
    Some(len)
}

fn closing_fence(lines: &[&str], from: usize, fence_len: usize) -> Option<usize> {
    (from..lines.len()).find(|&idx| {
        let trimmed = lines[idx].trim();
        let len = trimmed.chars().take_while(|&c| c == '`').count();
        len >= fence_len && trimmed[len..].trim().is_empty()
    })
}

fn render_line(line: &str) -> String {
    let trimmed = line.trim_start();
    let indent = &line[..line.len() - trimmed.len()];

    if let Some(heading) = parse_heading(trimmed) {
        return format!("{indent}<b>{}</b>", render_inline(heading));
    }

    // Bullet markers are emitted verbatim so "* item" never opens an italic.
    for marker in ["* ", "- ", "• ", "+ "] {
        if let Some(item) = trimmed.strip_prefix(marker) {
            return format!("{indent}{marker}{}", render_inline(item));
        }
    }

    format!("{indent}{}", render_inline(trimmed))
}

fn parse_heading(line: &str) -> Option<&str> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = line[hashes..].strip_prefix(' ')?;
    let text = rest.trim();
    (!text.is_empty()).then_some(text)
}

/// Convert inline Markdown in a single line of text.
pub(super) fn render_inline(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 16);
    render_span(&chars, &mut out, SpanContext::default());
    out
}

/// Nesting depth past which link and emphasis markers are left literal.
const MAX_NESTING: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
struct SpanContext {
    depth: usize,
    /// Telegram rejects `<a>` inside `<a>`.
    in_link: bool,
}

impl SpanContext {
    fn nested(self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self
        }
    }

    fn can_nest(self) -> bool {
        self.depth < MAX_NESTING
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delim {
    DoubleStar,
    DoubleUnderscore,
    Star,
    Underscore,
}

impl Delim {
    fn ch(self) -> char {
        match self {
            Self::DoubleStar | Self::Star => '*',
            Self::DoubleUnderscore | Self::Underscore => '_',
        }
    }

    fn width(self) -> usize {
        match self {
            Self::DoubleStar | Self::DoubleUnderscore => 2,
            Self::Star | Self::Underscore => 1,
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::DoubleStar => 0,
            Self::DoubleUnderscore => 1,
            Self::Star => 2,
            Self::Underscore => 3,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Self::DoubleStar | Self::DoubleUnderscore => "b",
            Self::Star | Self::Underscore => "i",
        }
    }
}

fn render_span(chars: &[char], out: &mut String, ctx: SpanContext) {
    // Delimiter kinds already known to have no closer in the rest of this span.
    let mut unclosed = [false; 4];
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        match ch {
            '\\' if next.is_some_and(|n| ESCAPABLE.contains(&n)) => {
                push_escaped(out, chars[i + 1]);
                i += 2;
            }
            '`' => {
                let run = run_length(chars, i, '`');
                match code_span_end(chars, i + run, run) {
                    Some(close) => {
                        let code: String = chars[i + run..close].iter().collect();
                        out.push_str("<code>");
                        out.push_str(&escape_html(&code));
                        out.push_str("</code>");
                        i = close + run;
                    }
                    None => {
                        out.extend(std::iter::repeat('`').take(run));
                        i += run;
                    }
                }
            }
            '[' if ctx.can_nest() && !ctx.in_link => match parse_link(chars, i) {
                Some(link) => {
                    out.push_str("<a href=\"");
                    out.push_str(&escape_attr(&decode_entities(&link.url)));
                    out.push_str("\">");
                    let label = SpanContext {
                        in_link: true,
                        ..ctx.nested()
                    };
                    render_span(&chars[link.label_start..link.label_end], out, label);
                    out.push_str("</a>");
                    i = link.end;
                }
                None => {
                    out.push('[');
                    i += 1;
                }
            },
            '*' | '_' if ctx.can_nest() => {
                let delim = opening_delim(chars, i).filter(|d| !unclosed[d.slot()]);
                let span = delim.and_then(|d| {
                    let close = closing_delim(chars, i + d.width(), d);
                    if close.is_none() {
                        unclosed[d.slot()] = true;
                    }
                    close.map(|c| (d, c))
                });
                match span {
                    Some((delim, close)) => {
                        let tag = delim.tag();
                        out.push('<');
                        out.push_str(tag);
                        out.push('>');
                        render_span(&chars[i + delim.width()..close], out, ctx.nested());
                        out.push_str("</");
                        out.push_str(tag);
                        out.push('>');
                        i = close + delim.width();
                    }
                    None => {
                        // Unpaired: keep the whole run literal so it is not
                        // re-read as a shorter delimiter.
                        let run = run_length(chars, i, ch);
                        out.extend(std::iter::repeat(ch).take(run));
                        i += run;
                    }
                }
            }
            '&' => match decode_entity_at(chars, i) {
                Some((decoded, len)) => {
                    push_escaped(out, decoded);
                    i += len;
                }
                None => {
                    out.push_str("&amp;");
                    i += 1;
                }
            },
            _ => {
                push_escaped(out, ch);
                i += 1;
            }
        }
    }
}

fn run_length(chars: &[char], start: usize, ch: char) -> usize {
    chars[start..].iter().take_while(|&&c| c == ch).count()
}

/// Index of the backtick run that closes a code span opened by `run` backticks.
fn code_span_end(chars: &[char], from: usize, run: usize) -> Option<usize> {
    let mut j = from;
    while j < chars.len() {
        if chars[j] == '`' {
            let len = run_length(chars, j, '`');
            if len == run {
                return Some(j);
            }
            j += len;
        } else {
            j += 1;
        }
    }
    None
}

fn is_word_char(c: Option<char>) -> bool {
    c.is_some_and(|c| c.is_alphanumeric())
}

fn opening_delim(chars: &[char], i: usize) -> Option<Delim> {
    let ch = chars[i];
    let run = run_length(chars, i, ch);
    let prev = i.checked_sub(1).map(|p| chars[p]);

    let delim = match (ch, run) {
        ('*', 1) => Delim::Star,
        ('*', _) => Delim::DoubleStar,
        ('_', 1) => Delim::Underscore,
        (_, _) => Delim::DoubleUnderscore,
    };

    let after = chars.get(i + delim.width()).copied();
    match delim {
        // Paired bold is always honoured.
        Delim::DoubleStar => Some(delim),
        Delim::Star => after.filter(|c| !c.is_whitespace()).map(|_| delim),
        Delim::Underscore | Delim::DoubleUnderscore => {
            if is_word_char(prev) || after.map_or(true, char::is_whitespace) {
                None
            } else {
                Some(delim)
            }
        }
    }
}

/// Find the delimiter closing `delim`, scanning from `from`.
///
/// Code spans are skipped. Runs of a different width are stepped over, except
/// that a longer run may close a bold span with its last two characters.
fn closing_delim(chars: &[char], from: usize, delim: Delim) -> Option<usize> {
    let ch = delim.ch();
    let mut j = from;
    while j < chars.len() {
        let c = chars[j];
        if c == '\\' {
            j += 2;
            continue;
        }
        if c == '`' {
            let run = run_length(chars, j, '`');
            j = match code_span_end(chars, j + run, run) {
                Some(end) => end + run,
                None => j + run,
            };
            continue;
        }
        if c != ch {
            j += 1;
            continue;
        }

        let run = run_length(chars, j, ch);
        let prev = j.checked_sub(1).map(|p| chars[p]);
        let after = chars.get(j + run).copied();
        let close_at = match delim {
            Delim::Star | Delim::Underscore if run == 1 => Some(j),
            Delim::DoubleStar | Delim::DoubleUnderscore if run >= 2 => Some(j + run - 2),
            _ => None,
        };

        if let Some(close) = close_at {
            let ok = match delim {
                Delim::DoubleStar => close > from,
                Delim::Star => close > from && !prev.is_some_and(char::is_whitespace),
                Delim::Underscore | Delim::DoubleUnderscore => {
                    close > from
                        && !prev.is_some_and(char::is_whitespace)
                        && !is_word_char(after)
                }
            };
            if ok {
                return Some(close);
            }
        }
        j += run;
    }
    None
}

struct Link {
    label_start: usize,
    label_end: usize,
    url: String,
    end: usize,
}

/// Parse `[label](url)` starting at `chars[start] == '['`.
fn parse_link(chars: &[char], start: usize) -> Option<Link> {
    let mut depth = 0usize;
    let mut label_end = None;
    for (j, &c) in chars.iter().enumerate().skip(start) {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    label_end = Some(j);
                    break;
                }
            }
            _ => {}
        }
    }
    let label_end = label_end?;
    if label_end == start + 1 || chars.get(label_end + 1) != Some(&'(') {
        return None;
    }

    let mut depth = 1usize;
    let mut url = String::new();
    let mut j = label_end + 2;
    loop {
        let c = *chars.get(j)?;
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            c if c.is_whitespace() => return None,
            _ => {}
        }
        url.push(c);
        j += 1;
    }
    if url.is_empty() {
        return None;
    }

    Some(Link {
        label_start: start + 1,
        label_end,
        url,
        end: j + 1,
    })
}
