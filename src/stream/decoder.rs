//! Incremental decoder for `{"answer": …, "sources": […]}` responses
//!
//! The engine streams one JSON object. The `answer` field is revealed while it
//! is still being produced; the closing boundary `", "sources` is never shown,
//! whatever whitespace the engine puts around the comma, and math inside the
//! answer goes through [`protect`] before display. At the end the whole object
//! is parsed for the authoritative citation list.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::latex::protect;
use super::DecoderError;
use crate::metrics::METRICS;

/// Canonical answer boundary; its length sets the reveal lookahead
pub const SOURCES_MARKER: &str = "\", \"sources";

const ANSWER_KEY: &str = "\"answer\"";

/// Closing quote of the answer followed by the sources key, in any spacing
static SOURCES_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^"\s*,\s*"sources"#).expect("static boundary pattern"));

/// JSON schema the engine is asked to follow
pub fn answer_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "answer": { "type": "string" },
            "sources": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["answer", "sources"]
    })
}

/// Final decoded response
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAnswer {
    pub answer: String,
    pub sources: Vec<String>,
    /// False when the final object did not parse and the streamed text was used
    pub parsed: bool,
}

#[derive(Debug, Deserialize)]
struct RawAnswer {
    answer: String,
    #[serde(default)]
    sources: Vec<Value>,
}

fn source_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => map.get("id").and_then(source_to_string),
        _ => None,
    }
}

fn locate_answer_start(raw: &str) -> Option<usize> {
    let key = raw.find(ANSWER_KEY)? + ANSWER_KEY.len();
    let colon = key + raw[key..].find(':')?;
    let quote = colon + 1 + raw[colon + 1..].find('"')?;
    Some(quote + 1)
}

/// Byte offset of the first quote not escaped by an odd backslash run
fn closing_quote(raw: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in raw.char_indices() {
        match c {
            '\\' => escaped = !escaped,
            '"' if !escaped => return Some(i),
            _ => escaped = false,
        }
    }
    None
}

/// Per-response decoding state
#[derive(Debug, Default)]
pub struct StreamDecoder {
    accumulated_raw: String,
    answer_start: Option<usize>,
    emitted: String,
    emitted_chars: usize,
    display_suppressed: bool,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder for a response schema, rejecting schemas that would not stream.
    ///
    /// Early display relies on `answer` being generated before `sources`.
    pub fn for_schema(schema: &Value) -> Result<Self, DecoderError> {
        let required: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();

        let answer = required
            .iter()
            .position(|f| *f == "answer")
            .ok_or(DecoderError::MissingField("answer"))?;
        let sources = required
            .iter()
            .position(|f| *f == "sources")
            .ok_or(DecoderError::MissingField("sources"))?;

        if answer > sources {
            return Err(DecoderError::FieldOrder);
        }
        Ok(Self::new())
    }

    /// Display text emitted so far
    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    pub fn is_suppressed(&self) -> bool {
        self.display_suppressed
    }

    /// Consume a fragment and return newly displayable text, if any
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        self.accumulated_raw.push_str(fragment);

        if self.answer_start.is_none() {
            self.answer_start = locate_answer_start(&self.accumulated_raw);
        }
        let start = self.answer_start?;
        if self.display_suppressed {
            return None;
        }

        let current = &self.accumulated_raw[start..];
        let close = closing_quote(current);

        if let Some(end) = close.filter(|end| SOURCES_BOUNDARY.is_match(&current[*end..])) {
            let processed = protect(&current[..end]);
            self.display_suppressed = true;
            debug!("Answer field complete after {} raw chars", end);
            return self.emit(processed);
        }

        // hold back enough to never show a partial marker
        let keep = current
            .chars()
            .count()
            .saturating_sub(SOURCES_MARKER.len());
        let end = current
            .char_indices()
            .nth(keep)
            .map(|(i, _)| i)
            .unwrap_or(current.len());
        // nothing past the end of the string value is answer text
        let end = close.map_or(end, |close| end.min(close));
        let mut revealed = &current[..end];

        // an escape sequence may straddle fragments
        let trailing = revealed.chars().rev().take_while(|c| *c == '\\').count();
        if trailing % 2 == 1 {
            revealed = &revealed[..revealed.len() - 1];
        }

        let processed = protect(revealed);
        self.emit(processed)
    }

    /// Emit the part of `processed` beyond what was already shown.
    ///
    /// Tracked by length: pipeline output is not positionally stable against
    /// raw input, so a shorter result emits nothing.
    fn emit(&mut self, processed: String) -> Option<String> {
        let total = processed.chars().count();
        if total <= self.emitted_chars {
            return None;
        }
        let delta: String = processed.chars().skip(self.emitted_chars).collect();
        self.emitted_chars = total;
        self.emitted.push_str(&delta);
        Some(delta)
    }

    /// Parse the complete object. Never fails: a malformed tail falls back to
    /// the text already streamed with no sources.
    pub fn finish(self) -> DecodedAnswer {
        let raw = self.accumulated_raw.trim();
        let parsed = serde_json::from_str::<RawAnswer>(raw).or_else(|e| {
            match (raw.find('{'), raw.rfind('}')) {
                (Some(open), Some(close)) if open < close => {
                    serde_json::from_str::<RawAnswer>(&raw[open..=close])
                }
                _ => Err(e),
            }
        });

        match parsed {
            Ok(answer) => DecodedAnswer {
                answer: answer.answer,
                sources: answer.sources.iter().filter_map(source_to_string).collect(),
                parsed: true,
            },
            Err(e) => {
                warn!("Final response did not parse ({}), using streamed text", e);
                METRICS.record_decode_fallback();
                DecodedAnswer {
                    answer: self.fallback_text(),
                    sources: Vec::new(),
                    parsed: false,
                }
            }
        }
    }

    fn fallback_text(&self) -> String {
        if !self.emitted.is_empty() {
            return self.emitted.clone();
        }
        match self.answer_start {
            Some(start) => {
                let current = self.accumulated_raw[start..]
                    .trim_end_matches(|c: char| c == '}' || c.is_whitespace());
                protect(current.strip_suffix('"').unwrap_or(current))
            }
            None => self.accumulated_raw.trim().to_string(),
        }
    }
}
