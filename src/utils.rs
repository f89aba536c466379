//! Small text-processing helpers shared across the kernel: JSON salvage from
//! noisy subprocess stdout, code-fence stripping for LLM responses, and
//! filesystem-safe id slugs.

#![allow(clippy::non_std_lazy_statics)]

use lazy_regex::lazy_regex;
use uuid::Uuid;

/// Matches ANSI escape sequences (CSI codes) so stdout from action bodies can
/// be cleaned before JSON extraction.
static RE_ANSI: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\x1b\[[0-9;]*[a-zA-Z]");

/// Matches a leading/trailing triple-backtick code fence, with an optional
/// language tag, around an LLM response.
static RE_CODE_FENCE: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"(?s)^\s*```[a-zA-Z0-9_+-]*\n?(.*?)\n?```\s*$");

/// Strips ANSI escape codes from text.
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    RE_ANSI.replace_all(text, "").to_string()
}

/// Strips a single leading/trailing triple-backtick fence from an LLM
/// response, if present. Responses that are not fenced are returned
/// unchanged.
#[must_use]
pub fn strip_code_fence(text: &str) -> String {
    RE_CODE_FENCE
        .captures(text.trim())
        .and_then(|caps| caps.get(1))
        .map_or_else(|| text.trim().to_string(), |m| m.as_str().to_string())
}

/// Locates the outermost balanced `{...}` or `[...]` JSON value in `text` and
/// parses it, searching from the last closing brace backward so that the
/// *last* JSON value in a noisy stream wins (mirrors the executor contract:
/// an action body may print banners before its single JSON result line).
///
/// # Errors
///
/// Returns `serde_json::Error` if no balanced JSON value parses.
pub fn extract_last_json(text: &str) -> Result<serde_json::Value, serde_json::Error> {
    let cleaned = strip_ansi(text);
    let bytes = cleaned.as_bytes();

    for (open, close) in [(b'{', b'}'), (b'[', b']')] {
        let mut candidates: Vec<(usize, usize)> = Vec::new();
        let mut stack: Vec<usize> = Vec::new();
        for (i, &b) in bytes.iter().enumerate() {
            if b == open {
                stack.push(i);
            } else if b == close {
                if let Some(start) = stack.pop() {
                    if stack.is_empty() {
                        candidates.push((start, i));
                    }
                }
            }
        }
        for (start, end) in candidates.into_iter().rev() {
            if let Ok(value) = serde_json::from_str(&cleaned[start..=end]) {
                return Ok(value);
            }
        }
    }

    // Fall back to a plain parse attempt so clean, unwrapped JSON still works.
    serde_json::from_str(cleaned.trim())
}

/// Generates a filesystem-safe slug from arbitrary text, with a random
/// 6-hex-digit suffix to disambiguate concurrent tasks of the same name.
#[must_use]
pub fn slugify_with_suffix(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_was_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "task" } else { slug };
    let suffix = &Uuid::new_v4().as_simple().to_string()[..6];
    format!("{slug}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_escape_codes() {
        let input = "\x1b[31mBanner\x1b[0m\n{\"a\":1}\n";
        assert_eq!(strip_ansi(input), "Banner\n{\"a\":1}\n");
    }

    #[test]
    fn extract_last_json_salvages_from_noisy_stdout() {
        let input = "\x1b[31mBanner\x1b[0m\n{\"a\":1}\n";
        let value = extract_last_json(input).expect("should parse");
        assert_eq!(value, serde_json::json!({"a": 1}));
    }

    #[test]
    fn extract_last_json_picks_last_value_after_banner_text() {
        let input = "STARTING\n{\"result\": 42}\nDONE";
        let value = extract_last_json(input).expect("should parse");
        assert_eq!(value, serde_json::json!({"result": 42}));
    }

    #[test]
    fn strip_code_fence_removes_backticks() {
        let input = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fence(input), "{\"a\":1}");
    }

    #[test]
    fn strip_code_fence_passes_through_unfenced_text() {
        assert_eq!(strip_code_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn slugify_with_suffix_is_filesystem_safe() {
        let slug = slugify_with_suffix("Summarize Q3 Report!!");
        assert!(slug.starts_with("summarize-q3-report"));
        assert!(slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }
}
