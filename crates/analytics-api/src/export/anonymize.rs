//! Recursive anonymization of personal identifiers in export payloads.

use sha2::{Digest, Sha256};

/// Keys whose string values are replaced by a hash wherever they appear.
const SENSITIVE_KEYS: &[&str] = &["email", "user_id", "anonymous_id", "lead_id"];

/// Stable one-way pseudonym: a truncated SHA-256 digest. The same input
/// always maps to the same token, so anonymized exports stay joinable.
pub fn pseudonym(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    format!("anon_{}", &hex::encode(digest)[..16])
}

/// Walks a JSON document and replaces the string values of sensitive keys,
/// at any nesting depth, with their pseudonyms.
pub fn anonymize_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if SENSITIVE_KEYS.contains(&key.as_str()) {
                    if let serde_json::Value::String(s) = entry {
                        *entry = serde_json::Value::String(pseudonym(s));
                    }
                } else {
                    anonymize_value(entry);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                anonymize_value(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pseudonym_is_stable_and_prefixed() {
        let a = pseudonym("a_u1");
        let b = pseudonym("a_u1");
        assert_eq!(a, b);
        assert!(a.starts_with("anon_"));
        assert_ne!(pseudonym("a_u1"), pseudonym("a_u2"));
    }

    #[test]
    fn anonymizes_nested_sensitive_keys() {
        let mut doc = json!({
            "export_metadata": { "funnel_id": "fn_1" },
            "rows": [
                { "anonymous_id": "a_u1", "email": "user@example.com", "event_name": "begin" },
                { "anonymous_id": "a_u2", "nested": { "user_id": "u42" } }
            ]
        });

        anonymize_value(&mut doc);

        assert_eq!(doc["export_metadata"]["funnel_id"], "fn_1");
        assert_eq!(doc["rows"][0]["event_name"], "begin");
        assert!(doc["rows"][0]["anonymous_id"].as_str().unwrap().starts_with("anon_"));
        assert!(doc["rows"][0]["email"].as_str().unwrap().starts_with("anon_"));
        assert!(doc["rows"][1]["nested"]["user_id"].as_str().unwrap().starts_with("anon_"));
    }

    #[test]
    fn non_string_sensitive_values_are_left_alone() {
        let mut doc = json!({ "user_id": 42 });
        anonymize_value(&mut doc);
        assert_eq!(doc["user_id"], 42);
    }
}
