//! HTML entity handling for the Telegram HTML subset.

/// Longest entity we try to recognize, including `&` and `;`.
const MAX_ENTITY_LEN: usize = 12;

fn named_entity(name: &str) -> Option<char> {
    let ch = match name {
        "quot" => '"',
        "apos" => '\'',
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "nbsp" => ' ',
        "ndash" => '–',
        "mdash" => '—',
        "hellip" => '…',
        "laquo" => '«',
        "raquo" => '»',
        "lsquo" => '‘',
        "rsquo" => '’',
        "ldquo" => '“',
        "rdquo" => '”',
        "copy" => '©',
        "reg" => '®',
        "trade" => '™',
        "bull" => '•',
        "middot" => '·',
        _ => return None,
    };
    Some(ch)
}

/// Try to decode an entity starting at `chars[start]` (which must be `&`).
///
/// Returns the decoded character and the number of chars consumed.
pub fn decode_entity_at(chars: &[char], start: usize) -> Option<(char, usize)> {
    if chars.get(start) != Some(&'&') {
        return None;
    }

    let end = chars
        .iter()
        .enumerate()
        .skip(start + 1)
        .take(MAX_ENTITY_LEN - 1)
        .find(|&(_, &c)| c == ';' || c.is_whitespace() || c == '&')
        .filter(|&(_, &c)| c == ';')
        .map(|(i, _)| i)?;

    let body: String = chars[start + 1..end].iter().collect();
    let decoded = if let Some(num) = body.strip_prefix('#') {
        let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse::<u32>().ok()?,
        };
        char::from_u32(code).filter(|c| *c != '\0')?
    } else {
        named_entity(&body)?
    };

    Some((decoded, end - start + 1))
}

/// Replace every recognizable entity with its literal character.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if let Some((ch, len)) = decode_entity_at(&chars, i) {
            result.push(ch);
            i += len;
        } else {
            result.push(chars[i]);
            i += 1;
        }
    }
    result
}

/// Escape text content for Telegram HTML.
pub fn escape_html(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        push_escaped(&mut result, ch);
    }
    result
}

/// Escape an attribute value (double-quoted).
pub fn escape_attr(text: &str) -> String {
    let mut result = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        if ch == '"' {
            result.push_str("&quot;");
        } else {
            push_escaped(&mut result, ch);
        }
    }
    result
}

pub fn push_escaped(out: &mut String, ch: char) {
    match ch {
        '&' => out.push_str("&amp;"),
        '<' => out.push_str("&lt;"),
        '>' => out.push_str("&gt;"),
        _ => out.push(ch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_and_numeric_entities() {
        assert_eq!(decode_entities("Tom &amp; Jerry"), "Tom & Jerry");
        assert_eq!(decode_entities("it&#39;s"), "it's");
        assert_eq!(decode_entities("&#x41;&#66;"), "AB");
        assert_eq!(decode_entities("a &ndash; b"), "a – b");
    }

    #[test]
    fn test_unknown_or_broken_entities_are_kept() {
        assert_eq!(decode_entities("&bogus; & more"), "&bogus; & more");
        assert_eq!(decode_entities("AT&T rocks;"), "AT&T rocks;");
        assert_eq!(decode_entities("&#0;"), "&#0;");
        assert_eq!(decode_entities("trailing &"), "trailing &");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape_html("a < b && c > d"), "a &lt; b &amp;&amp; c &gt; d");
        assert_eq!(escape_attr("x?a=\"1\"&b=2"), "x?a=&quot;1&quot;&amp;b=2");
    }
}
