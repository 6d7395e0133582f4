//! Middle-omission truncation for captured step output.
//!
//! Results are persisted and shipped back from agents, so a chatty command
//! must not blow up a row. Keeping the head and the tail preserves both the
//! invocation context and the final error.

pub const DEFAULT_MAX_CHARS: usize = 30_000;

/// Cut `text` down to roughly `max_chars` characters by dropping the middle.
///
/// Works on `char` boundaries so multi-byte sequences survive intact.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }

    let keep = max_chars / 2;
    let head: String = text.chars().take(keep).collect();
    let tail: String = text.chars().skip(total - keep).collect();
    let omitted = total - keep * 2;

    format!("{head}\n... [{omitted} chars omitted] ...\n{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_untouched() {
        assert_eq!(truncate_middle("exit 0", 100), "exit 0");
        let exact = "y".repeat(64);
        assert_eq!(truncate_middle(&exact, 64), exact);
    }

    #[test]
    fn keeps_head_and_tail() {
        let text = format!("{}{}{}", "H".repeat(10), "-".repeat(1000), "T".repeat(10));
        let out = truncate_middle(&text, 20);
        assert!(out.starts_with(&"H".repeat(10)));
        assert!(out.ends_with(&"T".repeat(10)));
        assert!(out.contains("[1000 chars omitted]"));
    }

    #[test]
    fn counts_chars_not_bytes() {
        let text = "é".repeat(50);
        let out = truncate_middle(&text, 10);
        assert!(out.contains("[40 chars omitted]"));
        assert_eq!(out.chars().filter(|c| *c == 'é').count(), 10);
    }
}
