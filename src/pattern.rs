//! Glob matching for identifiers supplied by policy authors.
//!
//! Patterns support `*` (any run of characters, including none) and `?`
//! (exactly one character). Matching is a single forward scan that remembers
//! only the most recent `*`, so the work is bounded by
//! `pattern.len() * value.len()` and never explodes on inputs like
//! `a*a*a*a*b`. Both inputs are length-capped before any scanning happens.

use crate::error::{Error, Result};

/// Longest pattern accepted by [`safe_pattern_match`], in bytes.
pub const MAX_PATTERN_LEN: usize = 256;

/// Longest value accepted by [`safe_pattern_match`], in bytes.
pub const MAX_VALUE_LEN: usize = 1024;

/// Matches `value` against a `*`/`?` glob `pattern`.
///
/// Oversized patterns or values never match.
pub fn safe_pattern_match(pattern: &str, value: &str) -> bool {
    if pattern.len() > MAX_PATTERN_LEN || value.len() > MAX_VALUE_LEN {
        tracing::warn!(
            pattern_len = pattern.len(),
            value_len = value.len(),
            "rejected oversized pattern match input"
        );
        return false;
    }
    if pattern == "*" {
        return true;
    }
    if !has_glob_chars(pattern) {
        return pattern == value;
    }

    let pattern = collapse_stars(pattern);
    let value: Vec<char> = value.chars().collect();

    let mut p = 0;
    let mut v = 0;
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while v < value.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == value[v]) {
            p += 1;
            v += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = v;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            resume += 1;
            v = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Validates a pattern at configuration time.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::InvalidPattern("pattern must not be empty".to_string()));
    }
    if pattern.len() > MAX_PATTERN_LEN {
        return Err(Error::InvalidPattern(format!(
            "pattern length must be <= {MAX_PATTERN_LEN}"
        )));
    }
    Ok(())
}

fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

fn collapse_stars(pattern: &str) -> Vec<char> {
    let mut out: Vec<char> = Vec::with_capacity(pattern.len());
    for ch in pattern.chars() {
        if ch == '*' && out.last() == Some(&'*') {
            continue;
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn prefix_wildcard_matches_same_resource_only() {
        assert!(safe_pattern_match("users:*", "users:read"));
        assert!(!safe_pattern_match("users:*", "orders:read"));
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        assert!(safe_pattern_match("doc-?", "doc-1"));
        assert!(!safe_pattern_match("doc-?", "doc-12"));
        assert!(!safe_pattern_match("doc-?", "doc-"));
    }

    #[test]
    fn inner_and_trailing_stars() {
        assert!(safe_pattern_match("a*c", "abbbc"));
        assert!(safe_pattern_match("a*c", "ac"));
        assert!(safe_pattern_match("a**", "a"));
        assert!(!safe_pattern_match("a*c", "abcd"));
        assert!(safe_pattern_match("*", ""));
        assert!(!safe_pattern_match("", "x"));
    }

    #[test]
    fn oversized_pattern_never_matches() {
        let pattern = "*".repeat(MAX_PATTERN_LEN + 1);
        assert!(!safe_pattern_match(&pattern, "anything"));
        let value = "a".repeat(MAX_VALUE_LEN + 1);
        assert!(!safe_pattern_match("*", &value));
    }

    #[test]
    fn adversarial_input_finishes_quickly() {
        let value = "a".repeat(MAX_VALUE_LEN);
        let start = Instant::now();
        for _ in 0..100 {
            assert!(!safe_pattern_match("a*a*a*a*a*a*a*a*b", &value));
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn validate_pattern_rejects_empty_and_long() {
        assert!(validate_pattern("users:*").is_ok());
        assert!(matches!(validate_pattern(""), Err(Error::InvalidPattern(_))));
        let long = "x".repeat(MAX_PATTERN_LEN + 1);
        assert!(matches!(validate_pattern(&long), Err(Error::InvalidPattern(_))));
    }
}
