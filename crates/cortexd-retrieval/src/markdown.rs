//! Minimal markdown heading recognition shared by the digest builder and
//! the excerpter. Not a full parser — just enough to find `#`-style
//! headings and their nesting level.

/// Returns the heading level (`1` for `#`, `2` for `##`, ...) if `line`
/// (already left-trimmed) opens with one or more `#` followed by a space
/// or end of line. Not a heading otherwise.
pub fn heading_level(line: &str) -> Option<usize> {
    if !line.starts_with('#') {
        return None;
    }
    let level = line.chars().take_while(|&c| c == '#').count();
    let rest = &line[level..];
    if rest.is_empty() || rest.starts_with(' ') {
        Some(level)
    } else {
        None
    }
}

/// The heading's visible text, with the leading `#` markers and
/// surrounding whitespace stripped.
pub fn heading_text(line: &str) -> &str {
    line.trim_start_matches('#').trim()
}
