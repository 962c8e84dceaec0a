//! Small string helpers for log output.

/// Truncate to at most `max_chars` characters, appending "..." if cut.
///
/// Cuts on character boundaries, so multi-byte text (emoji, CJK) is safe.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

/// One-line preview of message text: whitespace runs collapse to a single
/// space before truncation.
pub fn log_snippet(s: &str, max_chars: usize) -> String {
    let flattened = s.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_with_ellipsis(&flattened, max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_strings() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello", 5), "hello");
        assert_eq!(truncate_with_ellipsis("", 10), "");
    }

    #[test]
    fn truncate_cuts_and_trims() {
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
        assert_eq!(
            truncate_with_ellipsis("This is a long message", 10),
            "This is a..."
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
        assert_eq!(truncate_with_ellipsis("Olá 👍 mundo", 5), "Olá 👍...");
    }

    #[test]
    fn snippet_flattens_newlines() {
        assert_eq!(log_snippet("line one\n\nline two", 50), "line one line two");
        assert_eq!(log_snippet("  a\tb  ", 50), "a b");
        assert_eq!(log_snippet("first line\nsecond line", 5), "first...");
    }
}
