//! Tag balance tracking for Telegram HTML.
//!
//! A part cut out of a longer HTML message may leave tags open. The splitter
//! closes whatever is still open at the end of a part and reopens the same
//! tags, attributes included, at the start of the next one.

/// Tags Telegram understands. Anything else is treated as text.
const SUPPORTED_TAGS: &[&str] = &[
    "b",
    "strong",
    "i",
    "em",
    "u",
    "ins",
    "s",
    "strike",
    "del",
    "code",
    "pre",
    "a",
    "tg-spoiler",
    "blockquote",
];

/// An opening tag that has not been closed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenTag {
    pub name: String,
    /// The opening tag exactly as written, e.g. `<a href="...">`.
    pub raw: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Tag {
    Open(OpenTag),
    Close(String),
}

/// A tag found in the text, with its byte range.
#[derive(Debug)]
struct TagMatch {
    start: usize,
    end: usize,
    tag: Tag,
}

fn parse_tag(raw: &str) -> Option<Tag> {
    let inner = raw.strip_prefix('<')?.strip_suffix('>')?;
    let (closing, inner) = match inner.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let name_end = inner
        .find(|c: char| c.is_whitespace() || c == '/')
        .unwrap_or(inner.len());
    let name = inner[..name_end].to_ascii_lowercase();
    if !SUPPORTED_TAGS.contains(&name.as_str()) {
        return None;
    }

    if closing {
        Some(Tag::Close(name))
    } else {
        Some(Tag::Open(OpenTag {
            name,
            raw: raw.to_string(),
        }))
    }
}

fn scan_tags(text: &str) -> Vec<TagMatch> {
    let mut tags = Vec::new();
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('<') {
        let start = pos + offset;
        let Some(len) = text[start..].find('>') else {
            break;
        };
        let end = start + len + 1;
        // A '<' before the '>' means the first one was not a tag.
        if let Some(inner_lt) = text[start + 1..end].find('<') {
            pos = start + 1 + inner_lt;
            continue;
        }
        if let Some(tag) = parse_tag(&text[start..end]) {
            tags.push(TagMatch { start, end, tag });
        }
        pos = end;
    }
    tags
}

/// Compute the tags still open after `text`, given the tags that were
/// already open before it.
///
/// A closing tag pops up to its matching opener. A closing tag without one is
/// ignored here.
pub fn open_tags_after(text: &str, carried: &[OpenTag]) -> Vec<OpenTag> {
    let mut stack: Vec<OpenTag> = carried.to_vec();
    for found in scan_tags(text) {
        match found.tag {
            Tag::Open(open) => stack.push(open),
            Tag::Close(name) => {
                if let Some(idx) = stack.iter().rposition(|t| t.name == name) {
                    stack.truncate(idx);
                }
            }
        }
    }
    stack
}

/// Opening markup that restores `stack` at the start of a part.
pub fn reopen(stack: &[OpenTag]) -> String {
    stack.iter().map(|t| t.raw.as_str()).collect()
}

/// Closing markup for `stack`, innermost first.
pub fn close(stack: &[OpenTag]) -> String {
    stack
        .iter()
        .rev()
        .map(|t| format!("</{}>", t.name))
        .collect()
}

/// Check that `text`, on its own, opens and closes every supported tag in
/// properly nested order.
pub fn is_balanced(text: &str) -> bool {
    let mut stack: Vec<String> = Vec::new();
    for found in scan_tags(text) {
        match found.tag {
            Tag::Open(open) => stack.push(open.name),
            Tag::Close(name) => {
                if stack.pop().as_deref() != Some(name.as_str()) {
                    return false;
                }
            }
        }
    }
    stack.is_empty()
}

/// Make a standalone fragment well-formed: closers with no matching opener
/// are dropped, and tags left open are closed at the end.
pub fn repair(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + 16);
    let mut stack: Vec<OpenTag> = Vec::new();
    let mut last = 0;

    for found in scan_tags(text) {
        match found.tag {
            Tag::Open(open) => stack.push(open),
            Tag::Close(name) => match stack.iter().rposition(|t| t.name == name) {
                Some(idx) => {
                    // Close anything opened inside it first.
                    result.push_str(&text[last..found.start]);
                    result.push_str(&close(&stack[idx + 1..]));
                    result.push_str(&text[found.start..found.end]);
                    last = found.end;
                    stack.truncate(idx);
                }
                None => {
                    result.push_str(&text[last..found.start]);
                    last = found.end;
                }
            },
        }
    }
    result.push_str(&text[last..]);
    result.push_str(&close(&stack));
    result
}

/// Whether byte offset `pos` falls inside a tag (`<...>`).
///
/// Returns the start of that tag so a cut can be moved in front of it.
pub fn tag_start_containing(text: &str, pos: usize) -> Option<usize> {
    let before = &text[..pos];
    let lt = before.rfind('<')?;
    match before.rfind('>') {
        Some(gt) if gt > lt => None,
        _ => text[pos..].find('>').map(|_| lt),
    }
}

/// Whether byte offset `pos` falls inside an entity (`&...;`).
pub fn entity_start_containing(text: &str, pos: usize) -> Option<usize> {
    let before = &text[..pos];
    let amp = before.rfind('&')?;
    let partial = &before[amp + 1..];
    if partial.len() > 10 || partial.contains(|c: char| c == ';' || c.is_whitespace()) {
        return None;
    }
    let rest = &text[pos..];
    let semi = rest.find(';')?;
    if rest[..semi].contains(|c: char| c.is_whitespace() || c == '&') {
        return None;
    }
    Some(amp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_detection() {
        assert!(is_balanced("<b>bold <i>both</i></b> plain"));
        assert!(is_balanced("no tags &lt;b&gt; here"));
        assert!(!is_balanced("<b>open"));
        assert!(!is_balanced("close</b>"));
        assert!(!is_balanced("<b><i>crossed</b></i>"));
    }

    #[test]
    fn test_unknown_tags_are_ignored() {
        assert!(is_balanced("<div>whatever"));
        assert!(open_tags_after("<span>", &[]).is_empty());
    }

    #[test]
    fn test_open_tags_after_keeps_attributes() {
        let stack = open_tags_after(r#"<b>x <a href="http://x.com">lin"#, &[]);
        assert_eq!(stack.len(), 2);
        assert_eq!(stack[1].raw, r#"<a href="http://x.com">"#);
        assert_eq!(reopen(&stack), r#"<b><a href="http://x.com">"#);
        assert_eq!(close(&stack), "</a></b>");
    }

    #[test]
    fn test_open_tags_after_with_carried_tags() {
        let carried = open_tags_after("<b><i>", &[]);
        let stack = open_tags_after("tail</i> more", &carried);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0].name, "b");
    }

    #[test]
    fn test_repair_appends_closers_in_reverse_order() {
        assert_eq!(repair("<b>bold <i>it"), "<b>bold <i>it</i></b>");
        assert!(is_balanced(&repair("<b>bold <i>it")));
    }

    #[test]
    fn test_repair_drops_orphan_closers() {
        assert_eq!(repair("text</b> more"), "text more");
        assert_eq!(repair("<b>x</i>y</b>"), "<b>xy</b>");
        assert!(is_balanced(&repair("<i>a<b>b</i>c")));
    }

    #[test]
    fn test_position_inside_tag_or_entity() {
        let text = r#"ab <a href="u">x</a> &amp; y"#;
        assert_eq!(tag_start_containing(text, 6), Some(3));
        assert_eq!(tag_start_containing(text, 2), None);
        let amp = text.find('&').unwrap();
        assert_eq!(entity_start_containing(text, amp + 2), Some(amp));
        assert_eq!(entity_start_containing(text, amp), None);
    }
}
