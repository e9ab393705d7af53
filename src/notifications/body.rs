//! Body length helpers shared by services with provider-side limits.
//!
//! Limits are counted in characters, not bytes; every cut lands on a char
//! boundary.

const ELLIPSIS: &str = "...";

/// Clamp `body` to at most `max` characters, marking the cut with `...`.
///
/// `max == 0` means unlimited.
pub fn truncate(body: &str, max: usize) -> String {
    if max == 0 || body.chars().count() <= max {
        return body.to_string();
    }
    let ellipsis = ELLIPSIS.chars().count();
    if max <= ellipsis {
        return body.chars().take(max).collect();
    }
    let mut out: String = body.chars().take(max - ellipsis).collect();
    out.push_str(ELLIPSIS);
    out
}

/// Split `body` into chunks of at most `max` characters, preferring to break
/// after a newline or space when one falls in the back half of a chunk.
pub fn split(body: &str, max: usize) -> Vec<String> {
    if max == 0 || body.chars().count() <= max {
        return vec![body.to_string()];
    }
    let chars: Vec<char> = body.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + max).min(chars.len());
        if end < chars.len() {
            let window = &chars[start..end];
            let floor = max / 2;
            if let Some(pos) = window
                .iter()
                .rposition(|c| *c == '\n')
                .or_else(|| window.iter().rposition(|c| c.is_whitespace()))
                && pos >= floor
            {
                end = start + pos + 1;
            }
        }
        chunks.push(chars[start..end].iter().collect());
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::{split, truncate};

    #[test]
    fn truncate_respects_limit_and_char_boundaries() {
        assert_eq!(truncate("hello", 0), "hello");
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello world", 8), "hello...");
        let snowmen = "☃".repeat(20);
        let cut = truncate(&snowmen, 10);
        assert_eq!(cut.chars().count(), 10);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate("abcdef", 2), "ab");
    }

    #[test]
    fn split_prefers_line_breaks() {
        let body = format!("{}\n{}", "a".repeat(8), "b".repeat(8));
        let chunks = split(&body, 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}\n", "a".repeat(8)));
        assert_eq!(chunks[1], "b".repeat(8));
    }

    #[test]
    fn split_hard_cuts_without_whitespace() {
        let chunks = split(&"x".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
        assert_eq!(chunks.concat(), "x".repeat(25));
    }
}
