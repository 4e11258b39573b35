//! Canonical JSON encoding (spec.md §4.1): the deterministic byte representation that is signed
//! and verified. Two documents that are equal as TUF metadata must canonicalize to exactly the
//! same bytes regardless of field declaration order, `HashMap` iteration order, or incidental
//! whitespace in how they were originally parsed.
//!
//! We do not hand a `Serialize` impl directly to a `serde_json::Serializer` and trust its output
//! to be ordered: struct fields serialize in declaration order, and map-typed fields serialize in
//! whatever order the map iterates, neither of which is the mapping-key order TUF requires. The
//! safe construction is a dedicated pass over an intermediate value model: first serialize into a
//! `serde_json::Value` (whose `Map` is, absent the `preserve_order` feature, a `BTreeMap` and
//! therefore lexicographically ordered by construction), then walk that value ourselves and emit
//! bytes under an explicit, minimal grammar.

use crate::error::{CanonicalizeSnafu, Error};
use serde::Serialize;
use serde_json::Value;
use snafu::ResultExt;
use std::fmt::Write as _;

/// Encodes `value` into its canonical signed-bytes form.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    let value = serde_json::to_value(value).context(CanonicalizeSnafu {
        reason: "value could not be represented as JSON".to_string(),
    })?;
    let mut out = String::new();
    write_value(&value, &mut out)?;
    Ok(out.into_bytes())
}

fn write_value(value: &Value, out: &mut String) -> Result<(), Error> {
    match value {
        Value::Null => {
            out.push_str("null");
            Ok(())
        }
        Value::Bool(b) => {
            out.push_str(if *b { "true" } else { "false" });
            Ok(())
        }
        Value::Number(n) => write_number(n, out),
        Value::String(s) => {
            write_string(s, out);
            Ok(())
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out)?;
            }
            out.push(']');
            Ok(())
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, val)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(val, out)?;
            }
            out.push('}');
            Ok(())
        }
    }
}

fn write_number(n: &serde_json::Number, out: &mut String) -> Result<(), Error> {
    if let Some(u) = n.as_u64() {
        write!(out, "{u}").expect("writing to a String cannot fail");
        Ok(())
    } else if let Some(i) = n.as_i64() {
        write!(out, "{i}").expect("writing to a String cannot fail");
        Ok(())
    } else {
        Err(Error::CanonicalizeError {
            reason: format!("non-integer number {n} has no canonical representation"),
            backtrace: snafu::Backtrace::new(),
        })
    }
}

/// Writes `s` as a JSON string literal using the minimal escape set: quote, backslash, and the
/// control characters that are not otherwise representable. Everything else, including non-ASCII
/// UTF-8, passes through unescaped.
fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                write!(out, "\\u{:04x}", c as u32).expect("writing to a String cannot fail");
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys_lexicographically() {
        let value = json!({"b": 1, "a": 2, "c": 3});
        let bytes = to_canonical_bytes(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"a":2,"b":1,"c":3}"#);
    }

    #[test]
    fn is_insensitive_to_field_declaration_order() {
        let a = json!({"keytype": "ed25519", "scheme": "ed25519"});
        let b = json!({"scheme": "ed25519", "keytype": "ed25519"});
        assert_eq!(
            to_canonical_bytes(&a).unwrap(),
            to_canonical_bytes(&b).unwrap()
        );
    }

    #[test]
    fn omits_whitespace_and_escapes_control_characters() {
        let value = json!({"note": "line one\nline two"});
        let bytes = to_canonical_bytes(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"note":"line one\nline two"}"#
        );
    }

    #[test]
    fn rejects_floating_point_numbers() {
        let value = json!({"x": 1.5});
        assert!(to_canonical_bytes(&value).is_err());
    }
}
