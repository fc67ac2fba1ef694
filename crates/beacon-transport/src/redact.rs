// ABOUTME: Masking helpers for verbose request/response logging.
// ABOUTME: Hides app secrets and sensitive JSON fields, and skips binary payloads.

use std::collections::HashMap;

use serde_json::Value;

/// JSON keys whose values never appear in logs.
pub const SENSITIVE_FIELDS: &[&str] = &["token", "redirect_uri", "access_token", "refresh_token"];

pub const MASK: &str = "***";

const VISIBLE_SECRET_CHARS: usize = 8;

/// Replace every character of a secret except the last eight with `*`.
pub fn hide_secret(secret: &str) -> String {
    let len = secret.chars().count();
    let hidden = len.saturating_sub(VISIBLE_SECRET_CHARS);
    secret
        .chars()
        .enumerate()
        .map(|(i, c)| if i < hidden { '*' } else { c })
        .collect()
}

/// Copy of request headers that is safe to log.
pub fn redact_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(k, v)| {
            let value = if k.eq_ignore_ascii_case("app-secret") {
                hide_secret(v)
            } else if k.eq_ignore_ascii_case("authorization") {
                MASK.to_string()
            } else {
                v.clone()
            };
            (k.clone(), value)
        })
        .collect()
}

/// Text and JSON content types are printable; everything else is treated as binary.
pub fn is_text_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        None => true,
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("text/") || ct.contains("/json") || ct.contains("+json")
        }
    }
}

/// Printable form of a body: pretty JSON with sensitive fields masked,
/// raw text for non-JSON text, or a placeholder for binary content.
pub fn loggable_body(body: &str, content_type: Option<&str>) -> String {
    if !is_text_content_type(content_type) {
        return "<binary>".to_string();
    }
    match serde_json::from_str::<Value>(body) {
        Ok(mut value) => {
            mask_fields(&mut value);
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| body.to_string())
        }
        Err(_) => body.to_string(),
    }
}

fn mask_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if SENSITIVE_FIELDS.contains(&key.as_str()) {
                    *v = Value::String(MASK.to_string());
                } else {
                    mask_fields(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_fields),
        _ => {}
    }
}
