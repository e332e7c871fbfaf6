//! Prompt-size helpers.

/// Collapse whitespace and truncate at a word boundary so the result,
/// including `placeholder`, fits in `width` characters.
///
/// Text that already fits (after collapsing) is returned unchanged apart from
/// whitespace. When not even the first word fits, only the trimmed
/// placeholder is returned.
pub fn shorten(text: &str, width: usize, placeholder: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let collapsed = words.join(" ");
    if collapsed.chars().count() <= width {
        return collapsed;
    }

    let budget = width.saturating_sub(placeholder.chars().count());
    let mut kept = String::new();
    let mut kept_len = 0;
    for word in words {
        let word_len = word.chars().count();
        let needed = if kept.is_empty() {
            word_len
        } else {
            word_len + 1
        };
        if kept_len + needed > budget {
            break;
        }
        if !kept.is_empty() {
            kept.push(' ');
        }
        kept.push_str(word);
        kept_len += needed;
    }

    if kept.is_empty() {
        placeholder.trim_start().to_string()
    } else {
        format!("{kept}{placeholder}")
    }
}

/// First `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
