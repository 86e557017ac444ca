// Strips reasoning-trace markers from assistant text before it is persisted
// or emitted downstream. Only the tags are removed; the enclosed text stays.
use regex::Regex;
use std::sync::OnceLock;

static THINKING_TAGS: OnceLock<Regex> = OnceLock::new();

fn thinking_tags() -> &'static Regex {
    THINKING_TAGS.get_or_init(|| {
        Regex::new(r"(?i)</?(?:think|thinking|thought|antthinking)>").expect("valid tag pattern")
    })
}

pub fn strip_thinking_tags(text: &str) -> String {
    thinking_tags().replace_all(text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_tags_and_keeps_enclosed_text() {
        let input = "<think>deliberating</think>Answer: 42";
        assert_eq!(strip_thinking_tags(input), "deliberating Answer: 42");
    }

    #[test]
    fn handles_every_tag_family() {
        for tag in ["think", "thinking", "thought", "antthinking"] {
            let input = format!("<{tag}>inner</{tag}> outer");
            assert_eq!(strip_thinking_tags(&input), "inner  outer");
        }
    }

    #[test]
    fn is_case_insensitive() {
        let input = "<THINK>loud</Think> quiet";
        assert_eq!(strip_thinking_tags(input), "loud  quiet");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(strip_thinking_tags("<thinking></thinking> hi "), "hi");
    }

    #[test]
    fn is_idempotent() {
        let once = strip_thinking_tags("<thought>a</thought>b");
        assert_eq!(strip_thinking_tags(&once), once);
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(strip_thinking_tags("no tags here"), "no tags here");
    }
}
