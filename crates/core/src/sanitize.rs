//! Text sanitization and token-budget trimming for turn lists.

use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::trajectory::{Role, Turn};
use crate::turns::contains_error_keyword;
use crate::Tokenizer;

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"]+|www\.[^\s<>"]+"#).unwrap());
static BLANK_LINES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static SPACES_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" +").unwrap());
static TABS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\t+").unwrap());
static LONG_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{20,}\b").unwrap());
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});

/// Marker separating the task preamble from the observation in user turns.
pub const WEBPAGE_MARKER: &str = "Current webpage:";

/// Cap on assistant labels, in characters.
pub const MAX_ASSISTANT_CHARS: usize = 2000;

/// Observations above this size are cut when a list is over budget.
pub const AGGRESSIVE_OBSERVATION_CHARS: usize = 2000;

const MAX_OBSERVATION_LINES: usize = 500;
const KEPT_OBSERVATION_LINES: usize = 250;

/// Limits applied by [`postprocess_turns`].
#[derive(Debug, Clone, Copy)]
pub struct SanitizeOptions {
    pub max_tokens: usize,
    pub max_field_chars: usize,
}

/// First `n` characters of `text`.
pub fn char_prefix(text: &str, n: usize) -> &str {
    match text.char_indices().nth(n) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Last `n` characters of `text`.
pub fn char_suffix(text: &str, n: usize) -> &str {
    let total = text.chars().count();
    if total <= n {
        return text;
    }
    match text.char_indices().nth(total - n) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// Keep the first `max_chars` characters and mark the cut.
pub fn truncate_head(text: &str, max_chars: usize, marker: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    format!("{}{}", char_prefix(text, max_chars), marker)
}

/// Keep `max_chars / 2` characters from each end and mark the cut.
pub fn truncate_head_tail(text: &str, max_chars: usize, marker: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    format!("{}{}{}", char_prefix(text, half), marker, char_suffix(text, half))
}

/// Collapse blank lines and whitespace, decode entities, redact links.
pub fn normalize_text(text: &str) -> String {
    let mut s = BLANK_LINES_RE.replace_all(text, "\n\n").into_owned();

    s = s
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    s = SPACES_RE.replace_all(&s, " ").into_owned();
    s = TABS_RE.replace_all(&s, " ").into_owned();

    LINK_RE.replace_all(&s, "[URL]").into_owned()
}

/// Cap a field at `max_chars` and normalize it.
pub fn filter_train_data(text: &str, max_chars: usize) -> String {
    normalize_text(&truncate_head(text, max_chars, "... [truncated]"))
}

/// Redact long ids and emails, and shorten very long observations.
pub fn clean_observation(text: &str) -> String {
    let s = LONG_ID_RE.replace_all(text, "[LONG_ID]");
    let s = EMAIL_RE.replace_all(&s, "[EMAIL]").into_owned();

    let lines: Vec<&str> = s.split('\n').collect();
    if lines.len() <= MAX_OBSERVATION_LINES {
        return s;
    }
    let mut kept: Vec<&str> = lines[..KEPT_OBSERVATION_LINES].to_vec();
    kept.push("...");
    kept.extend_from_slice(&lines[lines.len() - KEPT_OBSERVATION_LINES..]);
    kept.join("\n")
}

fn total_tokens<T: Tokenizer>(turns: &[Turn], tokenizer: &T) -> usize {
    turns.iter().map(|t| tokenizer.count_tokens(&t.content)).sum()
}

/// Sanitize every turn of a list.
///
/// Returns `None` when an assistant turn reports a grounding error, in which
/// case the whole list should be dropped.
pub fn postprocess_turns<T: Tokenizer>(
    turns: &[Turn],
    tokenizer: &T,
    opts: &SanitizeOptions,
) -> Option<Vec<Turn>> {
    let aggressive = total_tokens(turns, tokenizer) > opts.max_tokens;

    let mut out = Vec::with_capacity(turns.len());
    for turn in turns {
        let content = match turn.role {
            Role::User if turn.content.contains(WEBPAGE_MARKER) => {
                sanitize_observation_turn(&turn.content, opts.max_field_chars, aggressive)
            }
            Role::Assistant => {
                let content = filter_train_data(&turn.content, opts.max_field_chars);
                if contains_error_keyword(&content) {
                    debug!("assistant turn reports an element error, dropping list");
                    return None;
                }
                truncate_head(&content, MAX_ASSISTANT_CHARS, "...[truncated]")
            }
            _ => filter_train_data(&turn.content, opts.max_field_chars),
        };
        out.push(Turn {
            role: turn.role,
            content,
        });
    }
    Some(out)
}

fn sanitize_observation_turn(content: &str, max_chars: usize, aggressive: bool) -> String {
    let normalized = normalize_text(content);
    let Some((intro, observation)) = normalized.split_once(WEBPAGE_MARKER) else {
        return truncate_head(&normalized, max_chars, "... [truncated]");
    };

    let mut observation = clean_observation(observation);
    observation = truncate_head_tail(&observation, max_chars, "\n...[truncated]...\n");
    if aggressive && observation.chars().count() > AGGRESSIVE_OBSERVATION_CHARS {
        observation = truncate_head_tail(
            &observation,
            AGGRESSIVE_OBSERVATION_CHARS,
            "...[truncated]...",
        );
    }
    format!("{}{}{}", intro, WEBPAGE_MARKER, observation)
}

/// Trim a turn list to fit `max_tokens`.
///
/// Lists already within budget come back unchanged. Otherwise the system turn
/// and the final six turns are always kept, and earlier user/assistant pairs
/// are re-inserted in order until the first one that no longer fits.
pub fn trim_to_budget<T: Tokenizer>(
    turns: Vec<Turn>,
    tokenizer: &T,
    max_tokens: usize,
) -> (Vec<Turn>, usize) {
    let counts: Vec<usize> = turns.iter().map(|t| tokenizer.count_tokens(&t.content)).collect();
    let total: usize = counts.iter().sum();

    if total <= max_tokens {
        return (turns, total);
    }
    if turns.len() <= 7 {
        warn!(total, max_tokens, "turn list over budget but too short to trim");
        return (turns, total);
    }

    warn!(total, max_tokens, "context size exceeds limit, trimming");

    let tail_start = turns.len() - 6;
    let mut kept_tokens = counts[0] + counts[tail_start..].iter().sum::<usize>();
    let mut remaining = max_tokens.saturating_sub(kept_tokens);
    let mut keep_middle = 1;

    for pair in counts[1..tail_start].chunks(2) {
        let cost: usize = pair.iter().sum();
        if cost > remaining {
            break;
        }
        remaining -= cost;
        kept_tokens += cost;
        keep_middle += pair.len();
    }

    let mut trimmed = Vec::with_capacity(keep_middle + 6);
    let mut iter = turns.into_iter();
    trimmed.extend(iter.by_ref().take(keep_middle));
    trimmed.extend(iter.skip(tail_start - keep_middle));
    (trimmed, kept_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CharApproxTokenizer;

    fn opts() -> SanitizeOptions {
        SanitizeOptions {
            max_tokens: 16_000,
            max_field_chars: 12_000,
        }
    }

    #[test]
    fn test_normalize_text() {
        let s = normalize_text("a\n\n\n\nb  c\t\td &lt;div&gt; &amp; https://gitlab.com/x?y=1 end");
        assert_eq!(s, "a\n\nb c d <div> & [URL] end");
        assert_eq!(normalize_text("see www.example.com now"), "see [URL] now");
    }

    #[test]
    fn test_clean_observation_redacts() {
        let s = clean_observation("id 123456789012345678901 by jane.doe@example.org");
        assert_eq!(s, "id [LONG_ID] by [EMAIL]");
    }

    #[test]
    fn test_clean_observation_long() {
        let obs = (0..600).map(|i| format!("line{}", i)).collect::<Vec<_>>().join("\n");
        let cleaned = clean_observation(&obs);
        let lines: Vec<&str> = cleaned.split('\n').collect();
        assert_eq!(lines.len(), 501);
        assert_eq!(lines[0], "line0");
        assert_eq!(lines[250], "...");
        assert_eq!(lines[500], "line599");
    }

    #[test]
    fn test_truncation_is_char_safe() {
        let s = "é".repeat(10);
        assert_eq!(truncate_head(&s, 3, "…"), "ééé…");
        assert_eq!(truncate_head_tail(&s, 4, "|"), "éé|éé");
        assert_eq!(char_suffix("abc", 5), "abc");
    }

    #[test]
    fn test_long_observation_keeps_head_and_tail() {
        let filler = format!("{}\n", "x".repeat(99)).repeat(150);
        let obs = format!("HEAD-MARK\n{}TAIL-MARK", filler);
        assert!(obs.chars().count() > 15_000);
        let turns = vec![
            Turn::system("sys"),
            Turn::user(format!("Task: t\n\nCurrent webpage:\n{}", obs)),
            Turn::assistant("click [1]"),
        ];
        let out = postprocess_turns(&turns, &CharApproxTokenizer, &opts()).unwrap();
        let content = &out[1].content;
        let (_, observation) = content.split_once(WEBPAGE_MARKER).unwrap();
        assert!(observation.chars().count() <= 12_000 + 32);
        assert!(observation.contains("HEAD-MARK"));
        assert!(observation.ends_with("TAIL-MARK"));
        assert!(observation.contains("...[truncated]..."));
    }

    #[test]
    fn test_postprocess_rejects_error_label() {
        let turns = vec![
            Turn::system("sys"),
            Turn::user("Task: t"),
            Turn::assistant("Element not found, retrying"),
        ];
        assert!(postprocess_turns(&turns, &CharApproxTokenizer, &opts()).is_none());
    }

    #[test]
    fn test_postprocess_caps_assistant() {
        let turns = vec![Turn::system("s"), Turn::user("u"), Turn::assistant("x".repeat(2500))];
        let out = postprocess_turns(&turns, &CharApproxTokenizer, &opts()).unwrap();
        assert_eq!(out[2].content, format!("{}...[truncated]", "x".repeat(2000)));
    }

    fn conversation(pairs: usize, chars: usize) -> Vec<Turn> {
        let mut turns = vec![Turn::system("s".repeat(chars))];
        for i in 0..pairs {
            turns.push(Turn::user(format!("{}{}", i, "u".repeat(chars))));
            turns.push(Turn::assistant(format!("{}{}", i, "a".repeat(chars))));
        }
        turns
    }

    #[test]
    fn test_trim_within_budget_is_identity() {
        let turns = conversation(6, 40);
        let (out, total) = trim_to_budget(turns.clone(), &CharApproxTokenizer, 10_000);
        assert_eq!(out, turns);
        let (again, total_again) = trim_to_budget(out, &CharApproxTokenizer, 10_000);
        assert_eq!(again, turns);
        assert_eq!(total, total_again);
    }

    #[test]
    fn test_trim_keeps_system_and_tail() {
        // every turn is ~10 tokens
        let turns = conversation(8, 40);
        let (out, total) = trim_to_budget(turns.clone(), &CharApproxTokenizer, 110);

        assert!(total <= 110);
        assert_eq!(out[0], turns[0]);
        assert_eq!(&out[out.len() - 6..], &turns[turns.len() - 6..]);
        // system + 6 tail = 70 tokens, leaving room for two earlier pairs
        assert_eq!(out.len(), 11);
        assert_eq!(out[1], turns[1]);
        assert_eq!(out[4], turns[4]);
        assert!(out.windows(2).all(|w| w[0].role != w[1].role));
    }

    #[test]
    fn test_trim_short_list_unchanged() {
        let turns = conversation(3, 400);
        let (out, _) = trim_to_budget(turns.clone(), &CharApproxTokenizer, 10);
        assert_eq!(out, turns);
    }
}
