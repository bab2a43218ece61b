//! The JSON path subset readiness requirements are written in.
//!
//! Accepted: an optional `{...}` wrapper and `$` root, dotted keys, `[n]` indices,
//! `[*]` or `.*` wildcards and quoted keys (`['a.b']`, `["a.b"]`).

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid JSON path {path:?}: {reason}")]
pub struct JsonPathError {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

fn is_key_char(c: char) -> bool { c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/' }

impl FromStr for JsonPath {
    type Err = JsonPathError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| JsonPathError { path: raw.to_string(), reason: reason.to_string() };
        let mut s = raw.trim();
        if let Some(inner) = s.strip_prefix('{') {
            s = inner.strip_suffix('}').ok_or_else(|| err("unbalanced braces"))?.trim();
        }
        s = s.strip_prefix('$').unwrap_or(s);
        if s.is_empty() { return Err(err("empty path")); }

        let chars: Vec<char> = s.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    if i < chars.len() && chars[i] == '*' {
                        segments.push(Segment::Wildcard);
                        i += 1;
                        continue;
                    }
                    let start = i;
                    while i < chars.len() && is_key_char(chars[i]) { i += 1; }
                    if start == i {
                        // `.[0]` is tolerated, `..` and a trailing dot are not.
                        if i < chars.len() && chars[i] == '[' { continue; }
                        return Err(err("empty segment"));
                    }
                    segments.push(Segment::Key(chars[start..i].iter().collect()));
                }
                '[' => {
                    let close = chars[i..].iter().position(|c| *c == ']').ok_or_else(|| err("unclosed bracket"))? + i;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    let seg = if inner == "*" {
                        Segment::Wildcard
                    } else if let Ok(n) = inner.parse::<usize>() {
                        Segment::Index(n)
                    } else if inner.len() >= 2
                        && ((inner.starts_with('\'') && inner.ends_with('\'')) || (inner.starts_with('"') && inner.ends_with('"')))
                    {
                        Segment::Key(inner[1..inner.len() - 1].to_string())
                    } else {
                        return Err(err("bracket must hold an index, * or a quoted key"));
                    };
                    segments.push(seg);
                    i = close + 1;
                }
                c if i == 0 && is_key_char(c) => {
                    let start = i;
                    while i < chars.len() && is_key_char(chars[i]) { i += 1; }
                    segments.push(Segment::Key(chars[start..i].iter().collect()));
                }
                c => return Err(err(&format!("unexpected character {c:?}"))),
            }
        }
        Ok(JsonPath { raw: raw.to_string(), segments })
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.raw) }
}

impl JsonPath {
    /// Every value the path resolves to. Empty means the field does not exist.
    pub fn find<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut cur = vec![root];
        for seg in &self.segments {
            let mut next = Vec::new();
            for v in cur {
                match seg {
                    Segment::Key(k) => next.extend(v.as_object().and_then(|m| m.get(k))),
                    Segment::Index(n) => next.extend(v.as_array().and_then(|a| a.get(*n))),
                    Segment::Wildcard => match v {
                        Value::Array(a) => next.extend(a.iter()),
                        Value::Object(m) => next.extend(m.values()),
                        _ => {}
                    },
                }
            }
            if next.is_empty() { return next; }
            cur = next;
        }
        cur
    }
}

/// Structural equality with numbers compared by value, so `1` equals `1.0`.
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b)),
        (Value::Object(x), Value::Object(y)) => x.len() == y.len() && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w))),
        _ => a == b,
    }
}
