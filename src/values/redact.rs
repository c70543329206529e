//! Display-time redaction of certificate and key material.
//!
//! Redaction only ever applies to what is printed or logged. The persisted
//! values secret always holds the unredacted tree.

use serde_json::{Map, Value};

/// Replacement for redacted material
pub const REDACTED: &str = "[redacted]";

/// Leaf names holding certificates or keys when found under [`TLS_SCOPES`]
const SENSITIVE_LEAVES: &[&str] = &["cert", "key", "crt"];

/// Map keys that introduce TLS material
const TLS_SCOPES: &[&str] = &["tls", "ca"];

/// Leaf names that are always secret-file payloads
const SECRET_FILE_KEYS: &[&str] = &["ca.crt", "ca.key", "tls.crt", "tls.key"];

const PEM_BEGIN: &str = "-----BEGIN ";
const PEM_END: &str = "-----END ";

/// `base64("-----BEGIN")`, the prefix of base64-wrapped PEM in Helm values
const B64_PEM_PREFIX: &str = "LS0tLS1CRUdJTi";

/// Whether a string looks like (possibly base64-wrapped) PEM
pub fn is_key_material(s: &str) -> bool {
    s.contains(PEM_BEGIN) || s.contains(B64_PEM_PREFIX)
}

/// Copy of `tree` with every certificate or key leaf replaced by [`REDACTED`]
pub fn redact_values(tree: &Value) -> Value {
    redact_scoped(tree, false)
}

fn is_sensitive(key: &str, value: &str, in_tls: bool) -> bool {
    if value.is_empty() {
        return false;
    }
    is_key_material(value)
        || SECRET_FILE_KEYS.contains(&key)
        || (in_tls && SENSITIVE_LEAVES.contains(&key))
}

fn redact_scoped(tree: &Value, in_tls: bool) -> Value {
    match tree {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, value) in map {
                let redacted = match value {
                    Value::String(s) if is_sensitive(key, s, in_tls) => {
                        Value::String(REDACTED.to_string())
                    }
                    other => redact_scoped(other, in_tls || TLS_SCOPES.contains(&key.as_str())),
                };
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| redact_scoped(v, in_tls)).collect()),
        Value::String(s) if is_key_material(s) => Value::String(REDACTED.to_string()),
        other => other.clone(),
    }
}

/// Replace PEM blocks and base64-wrapped PEM inside free text
pub fn redact_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(PEM_BEGIN) {
        out.push_str(&rest[..start]);
        out.push_str(REDACTED);
        let block = &rest[start..];
        rest = match block.find(PEM_END) {
            Some(end) => {
                let label = &block[end + PEM_END.len()..];
                match label.find("-----") {
                    Some(close) => &label[close + 5..],
                    None => "",
                }
            }
            None => "",
        };
    }
    out.push_str(rest);

    redact_base64_pem(&out)
}

fn redact_base64_pem(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(B64_PEM_PREFIX) {
        out.push_str(&rest[..start]);
        out.push_str(REDACTED);
        let token = &rest[start..];
        let end = token
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='))
            .unwrap_or(token.len());
        rest = &token[end..];
    }
    out.push_str(rest);
    out
}
