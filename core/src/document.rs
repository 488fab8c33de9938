//! The document data model: keys, the name grammar, and helpers for
//! reading/validating the mandatory `type`/`id` fields on a document value.

use serde_json::Value;

use crate::error::{Result, StoreError};

/// A `(type, id)` pair identifying one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub r#type: String,
    pub id: String,
}

impl Key {
    pub fn new(r#type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            id: id.into(),
        }
    }

    /// Validate both components against the name grammar.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.r#type)?;
        validate_name(&self.id)?;
        Ok(())
    }
}

/// Validate a `type` or `id` component against the name grammar: non-empty,
/// no leading/trailing separator, no path separator, no `..`, no leading
/// `.`, restricted to letters, digits, underscore, dash, dot.
pub fn validate_name(s: &str) -> Result<()> {
    if s.is_empty() {
        return Err(StoreError::Validation("name must not be empty".into()));
    }
    if s.starts_with('.') {
        return Err(StoreError::Validation(format!(
            "name {s:?} must not start with '.'"
        )));
    }
    if s.starts_with('-') || s.starts_with('_') || s.ends_with('-') || s.ends_with('_') {
        return Err(StoreError::Validation(format!(
            "name {s:?} must not lead/trail with a separator"
        )));
    }
    if s.contains("..") {
        return Err(StoreError::Validation(format!(
            "name {s:?} must not contain '..'"
        )));
    }
    if s.contains('/') || s.contains('\\') {
        return Err(StoreError::Validation(format!(
            "name {s:?} must not contain a path separator"
        )));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(StoreError::Validation(format!(
            "name {s:?} contains characters outside the name grammar"
        )));
    }
    Ok(())
}

/// Read the `type` field of a document value, if it is a well-formed string.
pub fn doc_type(doc: &Value) -> Option<&str> {
    doc.as_object()?.get("type")?.as_str()
}

/// Read the `id` field of a document value, if it is a well-formed string.
pub fn doc_id(doc: &Value) -> Option<&str> {
    doc.as_object()?.get("id")?.as_str()
}

/// Validate that `doc` is an object carrying `type`/`id` fields that match
/// `key` exactly.
pub fn validate_doc_matches_key(doc: &Value, key: &Key) -> Result<()> {
    if !doc.is_object() {
        return Err(StoreError::Validation(
            "document must be a JSON object".into(),
        ));
    }
    let t = doc_type(doc).ok_or_else(|| {
        StoreError::Validation("document is missing a string 'type' field".into())
    })?;
    let i =
        doc_id(doc).ok_or_else(|| StoreError::Validation("document is missing a string 'id' field".into()))?;
    if t != key.r#type {
        return Err(StoreError::Validation(format!(
            "document type {t:?} does not match key type {:?}",
            key.r#type
        )));
    }
    if i != key.id {
        return Err(StoreError::Validation(format!(
            "document id {i:?} does not match key id {:?}",
            key.id
        )));
    }
    Ok(())
}

/// Read a dotted field path from a document, traversing nested objects only
/// (never array indices). Returns `None` when an intermediate segment is
/// missing, which is distinct from a present `null`.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = doc;
    for seg in path.split('.') {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_ordinary_names() {
        assert!(validate_name("task").is_ok());
        assert!(validate_name("task-1.v2").is_ok());
        assert!(validate_name("a").is_ok());
    }

    #[test]
    fn rejects_name_grammar_violations() {
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("trailing-").is_err());
        assert!(validate_name("a..b").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("a b").is_err());
    }

    #[test]
    fn get_path_distinguishes_missing_from_null() {
        let doc = json!({"type": "task", "id": "1", "meta": {"status": null}});
        assert_eq!(get_path(&doc, "meta.status"), Some(&Value::Null));
        assert_eq!(get_path(&doc, "meta.missing"), None);
        assert_eq!(get_path(&doc, "absent.deeper"), None);
    }

    #[test]
    fn validate_doc_matches_key_checks_both_fields() {
        let key = Key::new("task", "1");
        let good = json!({"type": "task", "id": "1", "title": "A"});
        assert!(validate_doc_matches_key(&good, &key).is_ok());

        let bad_type = json!({"type": "note", "id": "1"});
        assert!(validate_doc_matches_key(&bad_type, &key).is_err());

        let bad_id = json!({"type": "task", "id": "2"});
        assert!(validate_doc_matches_key(&bad_id, &key).is_err());

        let not_object = json!([1, 2, 3]);
        assert!(validate_doc_matches_key(&not_object, &key).is_err());
    }
}
