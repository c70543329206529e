//! Parser for Helm's inline `--set` syntax.
//!
//! ```text
//! hubble.relay.enabled=true,hubble.ui.replicas=2
//! tolerations[0].key=node,labels.app\.kubernetes\.io/name=hubble
//! args={--debug,--pprof}
//! ```
//!
//! `\,` escapes a comma inside a value and `\.` escapes a dot inside a key.

use serde_json::{Map, Number, Value};

use crate::{Error, Result};

/// Largest list index accepted in a key
const MAX_INDEX: usize = 65536;

/// How the right-hand side of `key=value` is interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetKind {
    /// `--helm-set`: infer bools, null and integers
    Typed,
    /// `--helm-set-string`: always a string
    String,
    /// `--helm-set-file`: the value is a path whose contents become the string
    File,
}

impl SetKind {
    fn flag(&self) -> &'static str {
        match self {
            Self::Typed => "--helm-set",
            Self::String => "--helm-set-string",
            Self::File => "--helm-set-file",
        }
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse one `--set` style argument and apply each pair to `dest` in order.
pub fn parse_into(input: &str, kind: SetKind, dest: &mut Value) -> Result<()> {
    let chars: Vec<char> = input.chars().collect();
    let mut pos = 0;

    while pos < chars.len() {
        let (raw_key, next) = read_key(&chars, pos, kind)?;
        let path = parse_path(&raw_key, kind)?;
        let (value, next) = read_value(&chars, next, kind)?;
        set_at(dest, &path, value);
        pos = next;
    }
    Ok(())
}

/// Parse a list of arguments into a fresh tree; later arguments win.
pub fn parse_all(inputs: &[String], kind: SetKind) -> Result<Value> {
    let mut tree = Value::Object(Map::new());
    for input in inputs {
        parse_into(input, kind, &mut tree)?;
    }
    Ok(tree)
}

/// Read a raw key up to its `=`. Backslash escapes are kept for path parsing.
fn read_key(chars: &[char], mut pos: usize, kind: SetKind) -> Result<(String, usize)> {
    let mut key = String::new();
    while pos < chars.len() {
        match chars[pos] {
            '\\' if pos + 1 < chars.len() => {
                key.push('\\');
                key.push(chars[pos + 1]);
                pos += 2;
            }
            '=' => {
                if key.is_empty() {
                    return Err(Error::config(format!("{}: empty key", kind.flag())));
                }
                return Ok((key, pos + 1));
            }
            ',' => break,
            c => {
                key.push(c);
                pos += 1;
            }
        }
    }
    Err(Error::config(format!(
        "{}: key {:?} has no value (expected key=value)",
        kind.flag(),
        key
    )))
}

/// Read a value (scalar or `{a,b}` list) and return the position after its trailing comma.
fn read_value(chars: &[char], pos: usize, kind: SetKind) -> Result<(Value, usize)> {
    if chars.get(pos) == Some(&'{') {
        if kind == SetKind::File {
            return Err(Error::config(format!(
                "{}: list values are not supported",
                kind.flag()
            )));
        }
        let (items, next) = read_list(chars, pos + 1, kind)?;
        return Ok((Value::Array(items), next));
    }

    let (raw, next) = read_scalar(chars, pos, &[','])?;
    Ok((convert(&raw, kind)?, next + 1))
}

/// Read until one of `stops` (unescaped) or end of input. Returns the stop position.
fn read_scalar(chars: &[char], mut pos: usize, stops: &[char]) -> Result<(String, usize)> {
    let mut out = String::new();
    while pos < chars.len() {
        let c = chars[pos];
        if c == '\\' && pos + 1 < chars.len() {
            out.push(chars[pos + 1]);
            pos += 2;
            continue;
        }
        if stops.contains(&c) {
            break;
        }
        out.push(c);
        pos += 1;
    }
    Ok((out, pos))
}

fn read_list(chars: &[char], mut pos: usize, kind: SetKind) -> Result<(Vec<Value>, usize)> {
    let mut items = Vec::new();
    loop {
        let (raw, stop) = read_scalar(chars, pos, &[',', '}'])?;
        match chars.get(stop) {
            Some(',') => {
                items.push(convert(&raw, kind)?);
                pos = stop + 1;
            }
            Some('}') => {
                if !(raw.is_empty() && items.is_empty()) {
                    items.push(convert(&raw, kind)?);
                }
                return match chars.get(stop + 1) {
                    None => Ok((items, stop + 1)),
                    Some(',') => Ok((items, stop + 2)),
                    Some(c) => Err(Error::config(format!(
                        "{}: unexpected {:?} after list value",
                        kind.flag(),
                        c
                    ))),
                };
            }
            _ => {
                return Err(Error::config(format!(
                    "{}: list value is missing its closing '}}'",
                    kind.flag()
                )))
            }
        }
    }
}

fn convert(raw: &str, kind: SetKind) -> Result<Value> {
    match kind {
        SetKind::String => Ok(Value::String(raw.to_string())),
        SetKind::Typed => Ok(typed_value(raw)),
        SetKind::File => std::fs::read_to_string(raw)
            .map(Value::String)
            .map_err(|e| Error::config(format!("{}: unable to read {}: {}", kind.flag(), raw, e))),
    }
}

/// Infer the type of a `--helm-set` value the way Helm does.
fn typed_value(raw: &str) -> Value {
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" => return Value::Null,
        _ => {}
    }
    // Leading zeros keep the string form (zip codes, octal-looking ids)
    if raw.len() > 1 && raw.starts_with('0') {
        return Value::String(raw.to_string());
    }
    match raw.parse::<i64>() {
        Ok(n) => Value::Number(Number::from(n)),
        Err(_) => Value::String(raw.to_string()),
    }
}

fn parse_path(raw: &str, kind: SetKind) -> Result<Vec<Segment>> {
    let chars: Vec<char> = raw.chars().collect();
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut pos = 0;
    let malformed = |what: &str| Error::config(format!("{}: key {:?} {}", kind.flag(), raw, what));

    while pos < chars.len() {
        match chars[pos] {
            '\\' if pos + 1 < chars.len() => {
                current.push(chars[pos + 1]);
                pos += 2;
            }
            '.' => {
                if current.is_empty() && !matches!(segments.last(), Some(Segment::Index(_))) {
                    return Err(malformed("has an empty segment"));
                }
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                pos += 1;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                if segments.is_empty() {
                    return Err(malformed("starts with a list index"));
                }
                let close = chars[pos..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|offset| pos + offset)
                    .ok_or_else(|| malformed("has an unterminated list index"))?;
                let index: String = chars[pos + 1..close].iter().collect();
                let index: usize = index
                    .parse()
                    .map_err(|_| malformed("has an invalid list index"))?;
                if index > MAX_INDEX {
                    return Err(malformed("has a list index that is too large"));
                }
                segments.push(Segment::Index(index));
                pos = close + 1;
                if let Some(c) = chars.get(pos) {
                    if *c != '.' && *c != '[' {
                        return Err(malformed("has text after a list index"));
                    }
                }
            }
            c => {
                current.push(c);
                pos += 1;
            }
        }
    }
    if !current.is_empty() {
        segments.push(Segment::Key(current));
    } else if !matches!(segments.last(), Some(Segment::Index(_))) {
        return Err(malformed("ends with an empty segment"));
    }
    Ok(segments)
}

fn set_at(node: &mut Value, path: &[Segment], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *node = value;
        return;
    };
    match first {
        Segment::Key(key) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                set_at(map.entry(key.clone()).or_insert(Value::Null), rest, value);
            }
        }
        Segment::Index(index) => {
            if !node.is_array() {
                *node = Value::Array(Vec::new());
            }
            if let Value::Array(list) = node {
                if list.len() <= *index {
                    list.resize(*index + 1, Value::Null);
                }
                set_at(&mut list[*index], rest, value);
            }
        }
    }
}
