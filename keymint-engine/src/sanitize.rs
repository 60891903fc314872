//! Payload sanitization applied before persistence, plus the checkout text
//! cleaner for provider-facing fields.

use serde_json::Value;

/// Individual strings inside persisted payloads are capped at this length.
pub const MAX_STRING_LEN: usize = 1000;
/// Serialized payload objects are capped at this many bytes.
pub const MAX_OBJECT_BYTES: usize = 50_000;
/// Raw webhook bodies are capped at this many bytes.
pub const MAX_RAW_BODY_BYTES: usize = 10_000;

/// Truncate to at most `max` bytes without splitting a UTF-8 character.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

/// Sanitize a payload for persistence: every string is truncated to
/// [`MAX_STRING_LEN`], and if the whole object still serializes beyond
/// [`MAX_OBJECT_BYTES`] it is replaced by a size marker.
pub fn sanitize_json(value: &Value) -> Value {
    let trimmed = truncate_strings(value);
    let serialized_len = serde_json::to_string(&trimmed)
        .map(|s| s.len())
        .unwrap_or(usize::MAX);
    if serialized_len > MAX_OBJECT_BYTES {
        serde_json::json!({
            "truncated": true,
            "originalBytes": serialized_len,
        })
    } else {
        trimmed
    }
}

fn truncate_strings(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(truncate_str(s, MAX_STRING_LEN)),
        Value::Array(items) =>
            Value::Array(items.iter().map(truncate_strings).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_strings(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Cap a raw webhook body for the audit record.
pub fn cap_raw_body(body: &str) -> String {
    truncate_str(body, MAX_RAW_BODY_BYTES)
}

/// Clean a text field destined for a provider checkout: characters outside
/// `[\w\s.\-]` are removed, then the result is truncated to `max` chars.
pub fn checkout_text(s: &str, max: usize) -> String {
    s.chars()
        .filter(|c| {
            c.is_alphanumeric()
                || c.is_whitespace()
                || matches!(c, '_' | '.' | '-')
        })
        .take(max)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "ñañañá".repeat(300);
        let out = truncate_str(&s, MAX_STRING_LEN);
        assert!(out.len() <= MAX_STRING_LEN);
        assert!(out.is_char_boundary(out.len()));
    }

    #[test]
    fn long_strings_inside_payloads_are_trimmed() {
        let payload = json!({ "note": "x".repeat(5000), "amount": 42 });
        let out = sanitize_json(&payload);
        assert_eq!(out["note"].as_str().unwrap().len(), MAX_STRING_LEN);
        assert_eq!(out["amount"], 42);
    }

    #[test]
    fn oversized_objects_become_markers() {
        let big = json!({
            "entries": (0..200)
                .map(|i| json!({"k": format!("{i}"), "v": "y".repeat(900)}))
                .collect::<Vec<_>>(),
        });
        let out = sanitize_json(&big);
        assert_eq!(out["truncated"], true);
    }

    #[test]
    fn truncation_is_a_prefix_and_bounded() {
        proptest::proptest!(|(s in ".*", max in 0usize..64)| {
            let out = truncate_str(&s, max);
            proptest::prop_assert!(out.len() <= max);
            proptest::prop_assert!(s.starts_with(&out));
        })
    }

    #[test]
    fn checkout_text_strips_and_caps() {
        assert_eq!(
            checkout_text("Licencia #1: ¡Pro!", 30),
            "Licencia 1 Pro"
        );
        assert_eq!(checkout_text("abcdef", 3), "abc");
        assert_eq!(checkout_text("a_b.c-d e", 30), "a_b.c-d e");
    }
}
