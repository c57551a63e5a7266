//! Content hashing for duplicate suppression.
//!
//! The digest covers `(category, entity_key, payload)`. Numbers in the payload
//! are rounded to a fixed number of decimals and object keys are sorted, so
//! alerts that differ only by small score fluctuations or by field order hash
//! to the same value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write as _;

use crate::error::Result;

/// Hex-encoded SHA-256 digest of an alert's canonical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs.
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

/// Compute the dedup hash for an alert.
///
/// `precision` is the number of decimals numeric payload values are rounded to.
pub fn content_hash(
    category: &str,
    entity_key: Option<&str>,
    payload: &Value,
    precision: u32,
) -> Result<ContentHash> {
    let mut canonical = String::new();
    canonical.push_str(category);
    canonical.push('\u{1f}');
    canonical.push_str(entity_key.unwrap_or(""));
    canonical.push('\u{1f}');
    write_canonical(payload, precision, &mut canonical)?;

    let digest = Sha256::digest(canonical.as_bytes());
    Ok(ContentHash(hex::encode(digest)))
}

fn write_canonical(value: &Value, precision: u32, out: &mut String) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "{i}");
            } else if let Some(u) = n.as_u64() {
                let _ = write!(out, "{u}");
            } else {
                let rounded = round_to(n.as_f64().unwrap_or(0.0), precision);
                let _ = write!(out, "{:.*}", precision as usize, rounded);
            }
        }
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, precision, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(&map[key], precision, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn round_to(value: f64, precision: u32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let factor = 10f64.powi(precision as i32);
    let rounded = (value * factor).round() / factor;
    // Avoid "-0.00" and "0.00" hashing differently.
    if rounded == 0.0 {
        0.0
    } else {
        rounded
    }
}
