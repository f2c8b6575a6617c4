//! Content hashing over normalized extracted fields.
//!
//! The hash separates real content changes from re-fetch noise: whitespace and
//! letter case never move it, any tracked field value does. The canonical
//! payload is written by hand with sorted keys so the digest does not depend on
//! how `serde_json` happens to be configured elsewhere in the build.

use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::ExtractedFields;

/// Collapses whitespace runs to single spaces, trims, and lowercases.
pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalized_text_value(value: Option<&str>) -> JsonValue {
    match value.map(normalize_text) {
        Some(text) if !text.is_empty() => JsonValue::String(text),
        _ => JsonValue::Null,
    }
}

fn normalize_json(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(normalize_text(s)),
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(normalize_json).collect()),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_json(v)))
                .collect::<JsonMap<_, _>>(),
        ),
        other => other.clone(),
    }
}

/// Normalized payload the hash is computed over.
pub fn canonical_payload(fields: &ExtractedFields) -> JsonValue {
    let base = &fields.base_fields;
    let mut payload = JsonMap::new();
    payload.insert(
        "attributesJson".to_string(),
        normalize_json(&JsonValue::Object(fields.attributes_json.clone())),
    );
    payload.insert(
        "descriptionText".to_string(),
        normalized_text_value(base.description_text.as_deref()),
    );
    payload.insert(
        "priceAmount".to_string(),
        base.price_amount
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
    );
    payload.insert(
        "priceCurrency".to_string(),
        normalized_text_value(base.price_currency.as_deref()),
    );
    payload.insert(
        "primaryImageUrl".to_string(),
        match base.primary_image_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => JsonValue::String(url.to_string()),
            _ => JsonValue::Null,
        },
    );
    payload.insert(
        "title".to_string(),
        normalized_text_value(base.title.as_deref()),
    );
    JsonValue::Object(payload)
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// SHA-256 over the canonical payload, lowercase hex.
pub fn content_hash(fields: &ExtractedFields) -> String {
    let mut canonical = String::new();
    write_canonical(&canonical_payload(fields), &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
