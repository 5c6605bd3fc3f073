use std::fmt;

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Dataset-specific structured content of a record.
pub type Payload = serde_json::Value;

/// Stable identifier for the logical entity a record describes.
/// Each dataset determines its own key scheme (e.g., course section codes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key under which a repository's record is stored in a bucket and in
    /// the canonical store.
    pub fn namespaced(repository_id: &str, key: &RecordKey) -> Self {
        Self(format!("{repository_id}{KEY_SEPARATOR}{}", key.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Separator between repository id and record key in namespaced keys.
pub const KEY_SEPARATOR: &str = "__";

/// Content hash of a payload, used for change detection during sync.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// SHA-256 over the canonical JSON form of the payload, base64 encoded.
    ///
    /// Object keys are sorted before hashing, so two payloads that differ
    /// only in field order share a fingerprint.
    pub fn of(payload: &Payload) -> Self {
        let mut canonical = String::new();
        write_canonical(payload, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        Self(base64::engine::general_purpose::STANDARD.encode(digest))
    }

    /// Wrap a fingerprint string read back from a store.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn write_canonical(value: &Payload, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
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

/// A single unit of pulled data.
///
/// The fingerprint is always derived from the payload, so it cannot drift
/// from the content it describes.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    key: RecordKey,
    payload: Payload,
    fingerprint: Fingerprint,
}

impl Record {
    /// Build a record, fingerprinting its payload.
    pub fn new(key: impl Into<String>, payload: Payload) -> Self {
        let fingerprint = Fingerprint::of(&payload);
        Self {
            key: RecordKey::new(key),
            payload,
            fingerprint,
        }
    }

    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fingerprint_ignores_field_order() {
        let a = json!({"code": "CSC108", "section": "LEC0101", "meta": {"x": 1, "y": [1, 2]}});
        let b = json!({"meta": {"y": [1, 2], "x": 1}, "section": "LEC0101", "code": "CSC108"});
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = json!({"code": "CSC108", "enrolled": 120});
        let b = json!({"code": "CSC108", "enrolled": 121});
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn fingerprint_respects_array_order() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn fingerprint_is_base64_sha256() {
        let fp = Fingerprint::of(&json!({}));
        // 32 digest bytes encode to 44 base64 characters with padding.
        assert_eq!(fp.as_str().len(), 44);
        assert!(fp.as_str().ends_with('='));
    }

    #[test]
    fn record_new_fingerprints_payload() {
        let payload = json!({"code": "MAT137"});
        let record = Record::new("MAT137-LEC0101-20229", payload.clone());
        assert_eq!(record.key().as_str(), "MAT137-LEC0101-20229");
        assert_eq!(record.fingerprint(), &Fingerprint::of(&payload));
    }

    #[test]
    fn namespaced_key_joins_repository_and_key() {
        let key = RecordKey::namespaced("ttb-2023", &RecordKey::new("CSC108-LEC0101-20239"));
        assert_eq!(key.as_str(), "ttb-2023__CSC108-LEC0101-20239");
    }
}
