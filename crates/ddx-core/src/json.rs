//! Lenient JSON recovery for model output.
//!
//! Model responses are untrusted text. [`parse_lenient`] never fails: it
//! returns the parsed document, the first recoverable JSON object embedded in
//! the text, or a `{"raw": ..., "parse_error": true}` marker.
//!
//! # Algorithm
//!
//! 1. Parse the whole (trimmed) text as JSON.
//! 2. Otherwise look for balanced `{...}` spans. Braces inside string
//!    literals (honouring `\` escapes) do not count. Of the spans that parse
//!    as an object, the one opening earliest wins.
//! 3. Otherwise return the parse-error marker.

use serde_json::{Map, Value};

/// Key set on the marker object when nothing could be recovered.
pub const PARSE_ERROR_KEY: &str = "parse_error";

/// Parse model output, recovering an embedded JSON object when possible.
pub fn parse_lenient(raw: &str) -> Value {
    if let Ok(value) = serde_json::from_str::<Value>(raw.trim()) {
        return value;
    }
    first_json_object(raw).unwrap_or_else(|| parse_error_marker(raw))
}

/// Find the first balanced `{...}` span in `text` that parses as a JSON object.
///
/// One stack pass from a `{` matches every brace it sees outside string
/// literals. String state depends on where scanning began, so a `{` that pass
/// saw inside a string, and no earlier pass saw outside one, starts another.
pub fn first_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut covered = vec![false; bytes.len()];
    let mut best: Option<(usize, Value)> = None;
    let mut next = bytes.iter().position(|&b| b == b'{');

    while let Some(start) = next {
        if best.as_ref().is_some_and(|(open, _)| *open < start) {
            break;
        }
        let scan = scan_braces(bytes, start, &mut covered);
        for &(open, close) in &scan.pairs {
            if best.as_ref().is_some_and(|(b, _)| *b < open) {
                break;
            }
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text[open..=close]) {
                best = Some((open, value));
                break;
            }
        }
        next = scan.quoted_open;
    }
    best.map(|(_, value)| value)
}

struct BraceScan {
    /// Matched `(open, close)` byte offsets, ordered by `open`.
    pairs: Vec<(usize, usize)>,
    /// First `{` after the start that fell inside a string literal and that
    /// no pass has seen outside one.
    quoted_open: Option<usize>,
}

/// Match braces from `start` to the end of `bytes`, marking in `covered`
/// every `{` seen outside a string.
///
/// Works on bytes: `{`, `}`, `"` and `\` are ASCII and never occur inside a
/// multi-byte UTF-8 sequence, so every offset is a char boundary.
fn scan_braces(bytes: &[u8], start: usize, covered: &mut [bool]) -> BraceScan {
    let mut pairs = Vec::new();
    let mut quoted_open = None;
    let mut stack: Vec<usize> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            } else if b == b'{' && quoted_open.is_none() && !covered[i] {
                quoted_open = Some(i);
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                covered[i] = true;
                stack.push(i);
            }
            b'}' => {
                if let Some(open) = stack.pop() {
                    pairs.push((open, i));
                }
            }
            _ => {}
        }
    }
    pairs.sort_unstable();
    BraceScan { pairs, quoted_open }
}

fn parse_error_marker(raw: &str) -> Value {
    let mut map = Map::new();
    map.insert("raw".into(), Value::String(raw.to_string()));
    map.insert(PARSE_ERROR_KEY.into(), Value::Bool(true));
    Value::Object(map)
}

/// Whether a parsed value is the parse-error marker.
pub fn is_parse_error(value: &Value) -> bool {
    value
        .get(PARSE_ERROR_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
