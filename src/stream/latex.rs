//! Math-safe unescaping of JSON string content
//!
//! Answer text arrives still JSON-escaped, and LaTeX is itself backslash heavy.
//! Math spans are lifted out behind placeholders before the JSON escapes are
//! undone, then put back in unescaped form so a renderer sees single-backslash
//! commands.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Stands in for an escaped backslash while other escapes are rewritten
const BACKSLASH_SENTINEL: &str = "\u{E000}";
const PLACEHOLDER_OPEN: char = '\u{E001}';
const PLACEHOLDER_CLOSE: char = '\u{E002}';

/// Display math first so `$$` is never split into two inline spans
static MATH_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\$\$[\s\S]+?\$\$",
        r"\\{1,2}\[[\s\S]+?\\{1,2}\]",
        r"\$[^$]+?\$",
        r"\\{1,2}\([\s\S]+?\\{1,2}\)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static math pattern"))
    .collect()
});

/// Placeholder token to original math span, in extraction order
pub type MathPlaceholders = IndexMap<String, String>;

/// Undo the JSON escapes the answer field may contain.
///
/// Escaped backslashes are parked first so `\\n` stays a backslash followed by
/// `n`, and the sentinel is restored last so nothing is unescaped twice.
pub fn unescape_json(text: &str) -> String {
    text.replace("\\\\", BACKSLASH_SENTINEL)
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\r", "\r")
        .replace("\\/", "/")
        .replace("\\\"", "\"")
        .replace(BACKSLASH_SENTINEL, "\\")
}

/// Replace math spans with placeholders, recording the originals
pub fn extract_math(text: &str) -> (String, MathPlaceholders) {
    let mut placeholders = MathPlaceholders::new();
    let mut out = text.to_string();

    for pattern in MATH_PATTERNS.iter() {
        out = pattern
            .replace_all(&out, |caps: &Captures| {
                let token = format!(
                    "{}{}{}",
                    PLACEHOLDER_OPEN,
                    placeholders.len(),
                    PLACEHOLDER_CLOSE
                );
                placeholders.insert(token.clone(), caps[0].to_string());
                token
            })
            .into_owned();
    }

    (out, placeholders)
}

/// Put math spans back, each unescaped the same way as the surrounding text.
///
/// Later spans may enclose earlier placeholders, so they are restored first.
pub fn rehydrate(text: &str, placeholders: &MathPlaceholders) -> String {
    let mut out = text.to_string();
    for (token, original) in placeholders.iter().rev() {
        out = out.replace(token, &unescape_json(original));
    }
    out
}

/// Full pipeline: extract math, unescape, rehydrate
pub fn protect(raw: &str) -> String {
    let (extracted, placeholders) = extract_math(raw);
    rehydrate(&unescape_json(&extracted), &placeholders)
}
