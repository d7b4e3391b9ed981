//! Per-platform text limits.

use super::model::Platform;

const ELLIPSIS: &str = "...";

/// Truncates `content` to the platform's character ceiling. Truncated text
/// ends with "..." and never splits a character.
pub fn format_for_platform(content: &str, platform: Platform) -> String {
    truncate_chars(content, platform.max_text_len())
}

pub fn truncate_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let ellipsis_len = ELLIPSIS.chars().count();
    if max_chars <= ellipsis_len {
        return content.chars().take(max_chars).collect();
    }
    let keep = max_chars - ellipsis_len;
    let cut = content
        .char_indices()
        .nth(keep)
        .map(|(idx, _)| idx)
        .unwrap_or(content.len());
    format!("{}{}", content[..cut].trim_end(), ELLIPSIS)
}
