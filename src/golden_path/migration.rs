//! Schema upgrades for stored golden paths
//!
//! Upgrades run on the raw JSON value before typed deserialization. Fields an
//! older schema never recorded are filled with explicit "unknown" markers,
//! never with values inferred from other fields.

use serde_json::{json, Map, Value};
use tracing::info;

use super::document::SCHEMA_VERSION;
use crate::error::EngineError;

/// Schema version recorded in a raw document
pub fn stored_version(doc: &Value) -> Result<u32, EngineError> {
    doc.get("schema_version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| EngineError::InvalidGoldenPath("missing or invalid schema_version".to_string()))
}

/// Bring `doc` up to [`SCHEMA_VERSION`]. Returns whether anything changed.
pub fn upgrade(doc: &mut Value) -> Result<bool, EngineError> {
    let version = stored_version(doc)?;
    if version > SCHEMA_VERSION {
        return Err(EngineError::SchemaVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version == SCHEMA_VERSION {
        return Ok(false);
    }
    if version == 0 {
        return Err(EngineError::InvalidGoldenPath("schema_version 0 is not a golden path".to_string()));
    }

    let root = doc
        .as_object_mut()
        .ok_or_else(|| EngineError::InvalidGoldenPath("document is not an object".to_string()))?;

    if version < 2 {
        upgrade_v1(root)?;
    }
    if version < 3 {
        upgrade_v2(root)?;
    }

    root.insert("schema_version".to_string(), json!(SCHEMA_VERSION));
    info!(from = version, to = SCHEMA_VERSION, "Golden path schema upgraded");
    Ok(true)
}

/// v1 had no directionality, connection detail or use-case on patterns, and
/// no assertions, warnings or hub router on the document
fn upgrade_v1(root: &mut Map<String, Value>) -> Result<(), EngineError> {
    root.entry("hub_router_id").or_insert(Value::Null);
    root.entry("assertions").or_insert_with(|| json!([]));
    root.entry("warnings").or_insert_with(|| json!([]));

    for pattern in patterns_mut(root)? {
        pattern.entry("directionality").or_insert_with(|| json!("unknown"));
        pattern.entry("detail").or_insert_with(|| json!({ "detail": "unknown" }));
        pattern.entry("use_case").or_insert(Value::Null);
        pattern.entry("traffic").or_insert(Value::Null);
    }

    // Derived counts are rebuilt by the store after deserialization
    root.remove("summary");
    Ok(())
}

/// v2 never read security groups, so the ports they admit are unknown
fn upgrade_v2(root: &mut Map<String, Value>) -> Result<(), EngineError> {
    for pattern in patterns_mut(root)? {
        pattern.entry("ports_allowed").or_insert(Value::Null);
    }
    Ok(())
}

fn patterns_mut(root: &mut Map<String, Value>) -> Result<Vec<&mut Map<String, Value>>, EngineError> {
    root.get_mut("patterns")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| EngineError::InvalidGoldenPath("patterns missing".to_string()))?
        .iter_mut()
        .map(|pattern| {
            pattern
                .as_object_mut()
                .ok_or_else(|| EngineError::InvalidGoldenPath("pattern is not an object".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_version_is_untouched() {
        let mut doc = json!({ "schema_version": SCHEMA_VERSION, "patterns": [] });
        let before = doc.clone();
        assert!(!upgrade(&mut doc).unwrap());
        assert_eq!(doc, before);
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let mut doc = json!({ "schema_version": SCHEMA_VERSION + 1 });
        match upgrade(&mut doc) {
            Err(EngineError::SchemaVersion { found, supported }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(supported, SCHEMA_VERSION);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_v1_fields_default_to_unknown() {
        let mut doc = json!({
            "schema_version": 1,
            "patterns": [{ "connection_id": "pcx-1", "use_case": "backup" }],
            "summary": { "total": 1 }
        });
        assert!(upgrade(&mut doc).unwrap());

        assert_eq!(doc["schema_version"], json!(SCHEMA_VERSION));
        assert_eq!(doc["assertions"], json!([]));
        assert!(doc.get("summary").is_none());
        let pattern = &doc["patterns"][0];
        assert_eq!(pattern["directionality"], json!("unknown"));
        assert_eq!(pattern["detail"], json!({ "detail": "unknown" }));
        assert_eq!(pattern["use_case"], json!("backup"));
        assert_eq!(pattern["traffic"], Value::Null);
        assert_eq!(pattern["ports_allowed"], Value::Null);
    }

    #[test]
    fn test_v2_allowed_ports_are_unknown_not_empty() {
        let mut doc = json!({
            "schema_version": 2,
            "assertions": [],
            "patterns": [
                { "connection_id": "pcx-1", "directionality": "both" },
                { "connection_id": "pcx-2", "ports_allowed": [5432] }
            ],
            "summary": { "total": 2 }
        });
        assert!(upgrade(&mut doc).unwrap());

        assert_eq!(doc["schema_version"], json!(3));
        assert_eq!(doc["patterns"][0]["ports_allowed"], Value::Null);
        assert_eq!(doc["patterns"][0]["directionality"], json!("both"));
        assert_eq!(doc["patterns"][1]["ports_allowed"], json!([5432]));
        // Only v1 lacked a trustworthy summary
        assert_eq!(doc["summary"], json!({ "total": 2 }));
    }

    #[test]
    fn test_missing_version_is_invalid() {
        let mut doc = json!({ "patterns": [] });
        assert!(matches!(upgrade(&mut doc), Err(EngineError::InvalidGoldenPath(_))));
    }
}
