//! Pipe tables. Telegram has no table markup, so a table is flattened to a
//! bold header line, a rule, and one line per row.

use super::html::render_inline;

const RULE_WIDTH: usize = 30;

/// Render a table starting at `lines[0]`.
///
/// Returns the rendered block and the number of lines consumed, or `None`
/// when the lines do not start with a header row, a separator row and at
/// least one data row.
pub fn render_table(lines: &[&str]) -> Option<(String, usize)> {
    if lines.len() < 3 || !is_row(lines[0]) || !is_separator(lines[1]) {
        return None;
    }

    let rows = lines[2..]
        .iter()
        .take_while(|line| line.trim_start().starts_with('|'))
        .count();
    if rows == 0 {
        return None;
    }

    let header = cells(lines[0])
        .iter()
        .map(|cell| format!("<b>{}</b>", render_inline(cell)))
        .collect::<Vec<_>>()
        .join(" | ");

    let mut out = header;
    out.push('\n');
    out.push_str(&"-".repeat(RULE_WIDTH));
    for line in &lines[2..2 + rows] {
        out.push('\n');
        let row = cells(line)
            .iter()
            .map(|cell| render_inline(cell))
            .collect::<Vec<_>>()
            .join(" | ");
        out.push_str(&row);
    }

    Some((out, 2 + rows))
}

fn is_row(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 2 && trimmed.starts_with('|') && trimmed.ends_with('|')
}

fn is_separator(line: &str) -> bool {
    let trimmed = line.trim();
    is_row(trimmed)
        && trimmed.contains('-')
        && trimmed.chars().all(|c| matches!(c, '-' | ':' | '|' | ' '))
}

fn cells(row: &str) -> Vec<&str> {
    let trimmed = row.trim();
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(str::trim).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::html::markdown_to_html;

    #[test]
    fn test_table_is_flattened() {
        let input = "Results:\n| Name | Score |\n|:-----|------:|\n| Ann | 10 |\n| **Bob** | 7 |\nDone";
        let expected = format!(
            "Results:\n<b>Name</b> | <b>Score</b>\n{}\nAnn | 10\n<b>Bob</b> | 7\nDone",
            "-".repeat(30)
        );
        assert_eq!(markdown_to_html(input), expected);
    }

    #[test]
    fn test_header_without_rows_is_not_a_table() {
        assert!(render_table(&["| a | b |", "|---|---|"]).is_none());
        assert!(render_table(&["| a | b |", "|---|---|", "text"]).is_none());
        assert!(render_table(&["| a | b |", "| c | d |", "| e | f |"]).is_none());
    }

    #[test]
    fn test_consumed_line_count() {
        let lines = ["| a |", "|---|", "| 1 |", "| 2 |", "after"];
        let (_, consumed) = render_table(&lines).unwrap();
        assert_eq!(consumed, 4);
    }
}
