//! Pulls a bounded, relevant slice of text out of a document: either the
//! section under a named heading, or the lines surrounding query matches.

use crate::markdown::{heading_level, heading_text};

/// Lines of context kept on either side of a matching line in
/// [`window_around_match`].
pub const DEFAULT_WINDOW_LINES: usize = 3;

/// The result of an excerpt attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excerpt {
    pub text: String,
    pub truncated: bool,
}

fn truncate_with_marker(text: String, max_chars: usize) -> Excerpt {
    if text.chars().count() <= max_chars {
        Excerpt {
            text,
            truncated: false,
        }
    } else {
        let kept: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        Excerpt {
            text: format!("{kept}…"),
            truncated: true,
        }
    }
}

/// Case-insensitive substring match on heading text. Returns everything
/// from the matched heading down to (but not including) the next heading
/// of the same or higher level, truncated to `max_chars`.
pub fn section_by_heading(content: &str, heading: &str, max_chars: usize) -> Option<Excerpt> {
    let needle = heading.to_lowercase();
    let lines: Vec<&str> = content.lines().collect();

    let mut start = None;
    let mut start_level = 0;
    for (idx, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if let Some(level) = heading_level(trimmed) {
            if heading_text(trimmed).to_lowercase().contains(&needle) {
                start = Some(idx);
                start_level = level;
                break;
            }
        }
    }
    let start = start?;

    let mut end = lines.len();
    for (idx, line) in lines.iter().enumerate().skip(start + 1) {
        let trimmed = line.trim_start();
        if let Some(level) = heading_level(trimmed) {
            if level <= start_level {
                end = idx;
                break;
            }
        }
    }

    Some(truncate_with_marker(lines[start..end].join("\n"), max_chars))
}

/// Finds every line containing `query` (case-insensitive), merges
/// overlapping `±window_lines` ranges, and joins the merged windows with an
/// ellipsis marker. `None` if `query` matches nothing.
pub fn window_around_match(
    content: &str,
    query: &str,
    window_lines: usize,
    max_chars: usize,
) -> Option<Excerpt> {
    let needle = query.to_lowercase();
    let lines: Vec<&str> = content.lines().collect();

    let mut ranges: Vec<(usize, usize)> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.to_lowercase().contains(&needle))
        .map(|(idx, _)| {
            let start = idx.saturating_sub(window_lines);
            let end = (idx + window_lines + 1).min(lines.len());
            (start, end)
        })
        .collect();
    if ranges.is_empty() {
        return None;
    }
    ranges.sort_by_key(|r| r.0);

    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }

    let joined = merged
        .iter()
        .map(|&(s, e)| lines[s..e].join("\n"))
        .collect::<Vec<_>>()
        .join("\n…\n");
    Some(truncate_with_marker(joined, max_chars))
}

/// Last-resort excerpt when neither a heading hint nor a query match is
/// available: the top of the file.
pub fn top_of_file(content: &str, max_chars: usize) -> Excerpt {
    truncate_with_marker(content.to_string(), max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_by_heading_stops_at_same_level_heading() {
        let doc = "# Title\n\n## Tasks\n- one\n- two\n\n## Issues\n- bug\n";
        let excerpt = section_by_heading(doc, "tasks", 1000).unwrap();
        assert!(excerpt.text.contains("one"));
        assert!(!excerpt.text.contains("bug"));
    }

    #[test]
    fn section_by_heading_returns_none_without_match() {
        assert!(section_by_heading("# Title\nbody", "nope", 1000).is_none());
    }

    #[test]
    fn window_around_match_merges_overlapping_ranges() {
        let doc = "a\nb\nneedle\nc\nd\nneedle\ne\nf";
        let excerpt = window_around_match(doc, "needle", 1, 1000).unwrap();
        assert_eq!(excerpt.text, "b\nneedle\nc\nd\nneedle\ne");
    }

    #[test]
    fn truncates_with_marker_when_over_budget() {
        let excerpt = truncate_with_marker("abcdefghij".to_string(), 5);
        assert!(excerpt.truncated);
        assert_eq!(excerpt.text.chars().count(), 5);
    }
}
