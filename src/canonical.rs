//! Canonical payload encoding and content hashing
//!
//! A record's identity is the SHA-256 digest of a canonical rendering of
//! its `(kind, sub_type, payload)` triple. The rendering is
//! order-independent: document keys sort lexicographically, array elements
//! are deduplicated and sorted by their own canonical form, and strings are
//! whitespace-trimmed, so neither insertion order nor duplicate entries
//! ever change a hash.

use bson::{doc, Bson};
use sha2::{Digest, Sha256};

use crate::record::RecordKind;
use crate::types::{Result, WatchtowerError};

/// Render a payload value to its canonical textual form.
///
/// Supported types are string, number, boolean, null, document, and array;
/// anything else fails with `UnsupportedType`. Two values canonicalize to
/// the same string iff they are the same payload under the equivalence
/// rules above.
pub fn canonicalize(value: &Bson) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Lowercase hex SHA-256 digest of the canonical identity triple.
pub fn content_hash(kind: RecordKind, sub_type: &str, payload: &Bson) -> Result<String> {
    let identity = doc! {
        "kind": kind.as_str(),
        "sub_type": sub_type,
        "payload": payload.clone(),
    };
    let canonical = canonicalize(&Bson::Document(identity))?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(hex::encode(digest))
}

fn write_canonical(value: &Bson, out: &mut String) -> Result<()> {
    match value {
        Bson::Null => out.push_str("null"),
        Bson::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Bson::Int32(n) => out.push_str(&n.to_string()),
        Bson::Int64(n) => out.push_str(&n.to_string()),
        Bson::Double(f) => out.push_str(&canonical_double(*f)),
        Bson::String(s) => {
            let quoted =
                serde_json::to_string(s.trim()).expect("string encoding cannot fail");
            out.push_str(&quoted);
        }
        Bson::Array(items) => {
            let mut parts = Vec::with_capacity(items.len());
            for item in items {
                parts.push(canonicalize(item)?);
            }
            parts.sort();
            parts.dedup();
            out.push('[');
            out.push_str(&parts.join(","));
            out.push(']');
        }
        Bson::Document(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let quoted =
                    serde_json::to_string(key.as_str()).expect("string encoding cannot fail");
                out.push_str(&quoted);
                out.push(':');
                // Key presence is checked by construction of `keys`
                if let Some(child) = map.get(key.as_str()) {
                    write_canonical(child, out)?;
                }
            }
            out.push('}');
        }
        other => return Err(WatchtowerError::UnsupportedType(bson_type_name(other))),
    }
    Ok(())
}

/// Integral doubles render without a fractional part so `2.0` and `2i64`
/// canonicalize identically.
fn canonical_double(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e18 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

/// Human-readable tag for an unsupported BSON type.
pub(crate) fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Null => "null",
        Bson::Boolean(_) => "boolean",
        Bson::Int32(_) | Bson::Int64(_) => "integer",
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Array(_) => "array",
        Bson::Document(_) => "document",
        Bson::DateTime(_) => "datetime",
        Bson::ObjectId(_) => "objectid",
        Bson::Binary(_) => "binary",
        Bson::Timestamp(_) => "timestamp",
        Bson::RegularExpression(_) => "regex",
        Bson::Decimal128(_) => "decimal128",
        _ => "unsupported",
    }
}
