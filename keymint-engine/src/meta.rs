//! Append-merge helpers for the `meta` JSONB audit columns.
//!
//! `meta` holds append-only subtrees (`webhook`, `revived`,
//! `statusVerification`, `licenseChange`): each subtree is an array of
//! entries, newest last. Entries are never rewritten.

use keymint_common::time::TimestampMs;
use serde_json::{Value, json};

/// Push `entry` onto the `meta[key]` array, creating it if absent. A non-array
/// existing value is wrapped first, so malformed legacy rows don't panic.
pub fn append_entry(meta: &mut Value, key: &str, entry: Value) {
    if !meta.is_object() {
        *meta = json!({});
    }
    let map = meta.as_object_mut().expect("Just ensured meta is an object");
    let subtree = map.entry(key.to_owned()).or_insert_with(|| json!([]));
    if !subtree.is_array() {
        *subtree = json!([subtree.clone()]);
    }
    subtree
        .as_array_mut()
        .expect("Just ensured subtree is an array")
        .push(entry);
}

/// Set a scalar watermark field such as `lastWebhookAt`.
pub fn set_field(meta: &mut Value, key: &str, value: Value) {
    if !meta.is_object() {
        *meta = json!({});
    }
    meta.as_object_mut()
        .expect("Just ensured meta is an object")
        .insert(key.to_owned(), value);
}

/// Stamp `meta.lastWebhookAt = now` (milliseconds).
pub fn set_last_webhook_at(meta: &mut Value, at: TimestampMs) {
    set_field(meta, "lastWebhookAt", json!(at.as_i64()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_creates_and_extends() {
        let mut meta = Value::Null;
        append_entry(&mut meta, "webhook", json!({"status": "PENDING"}));
        append_entry(&mut meta, "webhook", json!({"status": "PAID"}));
        let entries = meta["webhook"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["status"], "PAID");
    }

    #[test]
    fn append_wraps_scalar_legacy_value() {
        let mut meta = json!({"webhook": {"status": "PENDING"}});
        append_entry(&mut meta, "webhook", json!({"status": "PAID"}));
        assert_eq!(meta["webhook"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn watermark_overwrites() {
        let mut meta = json!({});
        set_last_webhook_at(&mut meta, TimestampMs::from_i64(1).unwrap());
        set_last_webhook_at(&mut meta, TimestampMs::from_i64(2).unwrap());
        assert_eq!(meta["lastWebhookAt"], 2);
    }
}
