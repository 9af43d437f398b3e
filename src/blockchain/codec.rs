//! Canonical byte encoding of block fields and the SHA-256 digest over it.
//!
//! The preimage of a block hash is the concatenation of
//! `index`, `previous_hash`, the JSON text of the payload, `timestamp` and,
//! for proof-of-work blocks, `nonce`. The JSON text uses `", "` / `": "`
//! separators, keeps object keys in insertion order and escapes every
//! non-ASCII code point as `\uXXXX`. Floats, timestamps included, use the
//! shortest round-trip digits with a fractional part (`1700000000.0`);
//! below `1e-4` and from `1e16` upwards they switch to exponent form with a
//! signed two-digit exponent (`1e-07`, `1e+16`).
//! Changing any of this changes every hash in an existing ledger.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest
pub const HASH_HEX_LEN: usize = 64;

/// Computes the SHA-256 digest of `bytes` as a lowercase hex string
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Current time as fractional seconds since the Unix epoch
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Builds the canonical preimage of a block
///
/// # Arguments
///
/// * `index` - The block's position in the chain
/// * `previous_hash` - Hash of the preceding block
/// * `payload` - The block's payload
/// * `timestamp` - Creation time in seconds since the epoch
/// * `nonce` - The proof-of-work nonce, `None` for proof-of-stake blocks
///
/// # Returns
///
/// The UTF-8 bytes of the preimage
pub fn canonicalize(
    index: u64,
    previous_hash: &str,
    payload: &Value,
    timestamp: f64,
    nonce: Option<u64>,
) -> Vec<u8> {
    let mut preimage = canonical_prefix(index, previous_hash, payload, timestamp);
    if let Some(nonce) = nonce {
        preimage.push_str(&nonce.to_string());
    }
    preimage.into_bytes()
}

/// Preimage without the nonce; mining appends candidate nonces to this.
pub(crate) fn canonical_prefix(
    index: u64,
    previous_hash: &str,
    payload: &Value,
    timestamp: f64,
) -> String {
    let mut out = String::new();
    out.push_str(&index.to_string());
    out.push_str(previous_hash);
    write_json(&mut out, payload);
    out.push_str(&format_float(timestamp));
    out
}

/// Renders a float the way the ledger hashes it
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let sign = if value.is_sign_negative() { "-" } else { "" };
    let shortest = format!("{:e}", value.abs());
    let (mantissa, exponent) = shortest.split_once('e').unwrap_or((shortest.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    let body = if !(-4..16).contains(&exponent) {
        let (first, rest) = digits.split_at(1);
        let fraction = if rest.is_empty() {
            String::new()
        } else {
            format!(".{}", rest)
        };
        let exponent_sign = if exponent < 0 { '-' } else { '+' };
        format!("{}{}e{}{:02}", first, fraction, exponent_sign, exponent.abs())
    } else if exponent < 0 {
        format!("0.{}{}", "0".repeat((-exponent - 1) as usize), digits)
    } else {
        let point = exponent as usize + 1;
        if digits.len() > point {
            format!("{}.{}", &digits[..point], &digits[point..])
        } else {
            format!("{}{}.0", digits, "0".repeat(point - digits.len()))
        }
    };

    format!("{}{}", sign, body)
}

fn write_json(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => {
            let text = match number.as_f64() {
                Some(value) if number.is_f64() => format_float(value),
                _ => number.to_string(),
            };
            out.push_str(&text);
        }
        Value::String(text) => write_json_string(out, text),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_json(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_json_string(out, key);
                out.push_str(": ");
                write_json(out, item);
            }
            out.push('}');
        }
    }
}

fn write_json_string(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c.is_ascii() && c >= ' ' => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
        }
    }
    out.push('"');
}
