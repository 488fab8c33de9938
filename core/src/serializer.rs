//! Canonical serializer: produces byte-stable text for a JSON value given a
//! fixed set of options, so that semantically equal values produce
//! byte-identical output across runs and platforms.
//!
//! `serde_json::Value` is an owned tree (no shared/interior-mutable
//! references), so a cyclic document cannot actually be constructed in
//! this representation -- there is no `Rc`/`RefCell` back-edge a caller
//! could build. A depth guard stands in instead, catching the practical
//! failure mode (a pathologically deep document blowing the stack).

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// Maximum nesting depth the serializer will descend into. Chosen well
/// above any realistic document; existing only to fail cleanly instead of
/// overflowing the stack.
const MAX_DEPTH: usize = 512;

#[derive(Debug, Clone)]
pub enum KeyOrder {
    /// Sort keys by Unicode code point.
    Alpha,
    /// Listed keys first, in the given order; remaining keys alphabetical.
    Explicit(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SerializeOptions {
    pub indent: usize,
    pub key_order: KeyOrder,
    pub trailing_newline: bool,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            indent: 2,
            key_order: KeyOrder::Alpha,
            trailing_newline: true,
        }
    }
}

/// Produce the canonical text form of `value` under `opts`.
pub fn canonicalize(value: &Value, opts: &SerializeOptions) -> Result<String> {
    let mut out = String::new();
    write_value(&mut out, value, opts, 0)?;
    if opts.trailing_newline {
        out.push('\n');
    }
    Ok(out)
}

fn write_value(out: &mut String, value: &Value, opts: &SerializeOptions, depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(StoreError::Canonicalization(format!(
            "max nesting depth ({MAX_DEPTH}) exceeded"
        )));
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => write_array(out, items, opts, depth)?,
        Value::Object(map) => write_object(out, map, opts, depth)?,
    }
    Ok(())
}

fn write_string(out: &mut String, s: &str) {
    // Collapse embedded CRLF/lone CR before emission.
    let normalized = normalize_line_endings(s);
    // serde_json's string serialization already applies standard JSON
    // escaping; reuse it rather than hand-rolling the escape table.
    let escaped = serde_json::to_string(&normalized).expect("string serialization cannot fail");
    out.push_str(&escaped);
}

fn normalize_line_endings(s: &str) -> String {
    if !s.contains('\r') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\r' {
            if chars.peek() == Some(&'\n') {
                chars.next();
            }
            out.push('\n');
        } else {
            out.push(c);
        }
    }
    out
}

fn write_array(
    out: &mut String,
    items: &[Value],
    opts: &SerializeOptions,
    depth: usize,
) -> Result<()> {
    if items.is_empty() {
        out.push_str("[]");
        return Ok(());
    }
    out.push('[');
    out.push('\n');
    let inner_indent = " ".repeat(opts.indent * (depth + 1));
    for (i, item) in items.iter().enumerate() {
        out.push_str(&inner_indent);
        write_value(out, item, opts, depth + 1)?;
        if i + 1 < items.len() {
            out.push(',');
        }
        out.push('\n');
    }
    out.push_str(&" ".repeat(opts.indent * depth));
    out.push(']');
    Ok(())
}

fn write_object(
    out: &mut String,
    map: &Map<String, Value>,
    opts: &SerializeOptions,
    depth: usize,
) -> Result<()> {
    if map.is_empty() {
        out.push_str("{}");
        return Ok(());
    }
    let keys = ordered_keys(map, &opts.key_order);
    out.push('{');
    out.push('\n');
    let inner_indent = " ".repeat(opts.indent * (depth + 1));
    for (i, key) in keys.iter().enumerate() {
        out.push_str(&inner_indent);
        write_string(out, key);
        out.push_str(": ");
        write_value(out, &map[*key], opts, depth + 1)?;
        if i + 1 < keys.len() {
            out.push(',');
        }
        out.push('\n');
    }
    out.push_str(&" ".repeat(opts.indent * depth));
    out.push('}');
    Ok(())
}

fn ordered_keys<'a>(map: &'a Map<String, Value>, order: &KeyOrder) -> Vec<&'a String> {
    match order {
        KeyOrder::Alpha => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            keys
        }
        KeyOrder::Explicit(listed) => {
            let mut keys = Vec::with_capacity(map.len());
            for k in listed {
                if let Some((actual_key, _)) = map.get_key_value(k.as_str()) {
                    keys.push(actual_key);
                }
            }
            let mut remaining: Vec<&String> = map
                .keys()
                .filter(|k| !listed.contains(*k))
                .collect();
            remaining.sort_by(|a, b| a.as_str().cmp(b.as_str()));
            keys.extend(remaining);
            keys
        }
    }
}

/// Compare two values for semantic equality by canonicalizing both at
/// zero indent and comparing the resulting strings.
pub fn json_equal(a: &Value, b: &Value) -> bool {
    let opts = SerializeOptions {
        indent: 0,
        key_order: KeyOrder::Alpha,
        trailing_newline: false,
    };
    match (canonicalize(a, &opts), canonicalize(b, &opts)) {
        (Ok(sa), Ok(sb)) => sa == sb,
        _ => false,
    }
}

/// The outcome of a best-effort parse, used by bulk operations (like
/// `format`) that need to classify parse failures without throwing through
/// a hot loop.
pub enum ParseOutcome {
    Ok(Value),
    Err(String),
}

pub fn safe_parse(text: &str) -> ParseOutcome {
    match serde_json::from_str::<Value>(text) {
        Ok(v) => ParseOutcome::Ok(v),
        Err(e) => ParseOutcome::Err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_alphabetically() {
        let value = json!({"z": 1, "a": 2, "m": 3});
        let text = canonicalize(&value, &SerializeOptions::default()).unwrap();
        assert_eq!(text, "{\n  \"a\": 2,\n  \"m\": 3,\n  \"z\": 1\n}\n");
    }

    #[test]
    fn explicit_key_order_then_alpha_remainder() {
        let value = json!({"z": 1, "id": "1", "type": "task", "a": 2});
        let opts = SerializeOptions {
            indent: 2,
            key_order: KeyOrder::Explicit(vec!["type".into(), "id".into()]),
            trailing_newline: true,
        };
        let text = canonicalize(&value, &opts).unwrap();
        assert_eq!(
            text,
            "{\n  \"type\": \"task\",\n  \"id\": \"1\",\n  \"a\": 2,\n  \"z\": 1\n}\n"
        );
    }

    #[test]
    fn collapses_crlf_and_lone_cr() {
        let value = json!({"text": "a\r\nb\rc"});
        let text = canonicalize(&value, &SerializeOptions::default()).unwrap();
        assert!(text.contains("a\\nb\\nc"));
    }

    #[test]
    fn single_trailing_newline() {
        let value = json!({"a": 1});
        let text = canonicalize(&value, &SerializeOptions::default()).unwrap();
        assert!(text.ends_with("}\n"));
        assert!(!text.ends_with("}\n\n"));
    }

    #[test]
    fn empty_object_and_array_are_compact() {
        let value = json!({"obj": {}, "arr": []});
        let text = canonicalize(&value, &SerializeOptions::default()).unwrap();
        assert!(text.contains("\"arr\": []"));
        assert!(text.contains("\"obj\": {}"));
    }

    #[test]
    fn json_equal_ignores_key_order_and_whitespace() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert!(json_equal(&a, &b));
        let c = json!({"a": 1, "b": 3});
        assert!(!json_equal(&a, &c));
    }

    #[test]
    fn round_trip_is_byte_stable() {
        let value = json!({"type": "task", "id": "1", "tags": ["a", "b"], "n": 1.5});
        let opts = SerializeOptions::default();
        let once = canonicalize(&value, &opts).unwrap();
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        let twice = canonicalize(&reparsed, &opts).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn safe_parse_classifies_without_panicking() {
        match safe_parse("{not json") {
            ParseOutcome::Err(_) => {}
            ParseOutcome::Ok(_) => panic!("expected parse error"),
        }
        match safe_parse("{\"a\":1}") {
            ParseOutcome::Ok(_) => {}
            ParseOutcome::Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
