//! Schema validation guarding the ingest path.
//!
//! Declared fields are strictly typed and rejected with the offending field
//! name on mismatch. Undeclared fields are accepted and retained as opaque
//! string labels: benchmark drivers grow new fields without coordination,
//! so the top level of the schema stays open.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::document::{parse_timestamp, MetricValue, ResultDocument};
use crate::error::SchemaError;

/// Declared metric summary keys inside `value`.
const SUMMARY_KEYS: [&str; 5] = ["single", "min", "mean", "median", "max"];

/// Validates raw result documents into [`ResultDocument`]s.
///
/// Validation is pure: it never touches a store and never mutates its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    /// Create a validator.
    pub fn new() -> Self {
        Self
    }

    /// Validate one raw JSON document.
    ///
    /// Returns the typed document on success, or the first violation found.
    /// Unknown top-level fields never fail validation; non-string unknown
    /// values are canonicalized to their compact JSON text.
    pub fn validate(&self, raw: &Value) -> Result<ResultDocument, SchemaError> {
        let obj = raw
            .as_object()
            .ok_or_else(|| SchemaError::new("document", "expected a JSON object"))?;

        let test_execution_id = required_string(obj, "test-execution-id")?;
        let test_execution_timestamp = timestamp_field(obj, "test-execution-timestamp")?;
        let name = required_string(obj, "name")?;
        let value = value_field(obj)?;

        let active = match obj.get("active") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(SchemaError::new(
                    "active",
                    format!("expected a boolean, got {other}"),
                ))
            }
        };

        let doc = ResultDocument {
            test_execution_id,
            test_execution_timestamp,
            active,
            benchmark_version: optional_string(obj, "benchmark-version")?,
            benchmark_revision: optional_string(obj, "benchmark-revision")?,
            environment: optional_string(obj, "environment")?,
            workload: optional_string(obj, "workload")?,
            test_procedure: optional_string(obj, "test_procedure")?,
            provision_config_instance: optional_string(obj, "provision-config-instance")?,
            distribution_flavor: optional_string(obj, "distribution-flavor")?,
            distribution_version: optional_string(obj, "distribution-version")?,
            distribution_major_version: optional_integer(obj, "distribution-major-version")?,
            node_count: optional_integer(obj, "node-count")?,
            task: optional_string(obj, "task")?,
            operation: optional_string(obj, "operation")?,
            job: optional_string(obj, "job")?,
            name,
            plugins: plugins_field(obj)?,
            value,
            labels: collect_labels(obj),
        };
        Ok(doc)
    }
}

/// All declared top-level field names; anything else becomes a label.
fn is_declared(field: &str) -> bool {
    matches!(
        field,
        "test-execution-id"
            | "test-execution-timestamp"
            | "active"
            | "benchmark-version"
            | "benchmark-revision"
            | "environment"
            | "workload"
            | "test_procedure"
            | "provision-config-instance"
            | "distribution-flavor"
            | "distribution-version"
            | "distribution-major-version"
            | "node-count"
            | "task"
            | "operation"
            | "job"
            | "name"
            | "plugins"
            | "value"
    )
}

fn required_string(obj: &Map<String, Value>, field: &str) -> Result<String, SchemaError> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(SchemaError::new(field, "must not be empty")),
        Some(other) => Err(SchemaError::new(
            field,
            format!("expected a string, got {other}"),
        )),
        None | Some(Value::Null) => Err(SchemaError::new(field, "required field is missing")),
    }
}

fn optional_string(obj: &Map<String, Value>, field: &str) -> Result<Option<String>, SchemaError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SchemaError::new(
            field,
            format!("expected a string, got {other}"),
        )),
    }
}

/// Integers may arrive as JSON floats (`3.0`); fractional or negative
/// values are rejected rather than truncated.
fn optional_integer(obj: &Map<String, Value>, field: &str) -> Result<Option<u32>, SchemaError> {
    let number = match obj.get(field) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n,
        Some(other) => {
            return Err(SchemaError::new(
                field,
                format!("expected an integer, got {other}"),
            ))
        }
    };
    if let Some(v) = number.as_u64() {
        return u32::try_from(v)
            .map(Some)
            .map_err(|_| SchemaError::new(field, format!("{v} is out of range")));
    }
    if let Some(v) = number.as_f64() {
        if v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) {
            return Ok(Some(v as u32));
        }
    }
    Err(SchemaError::new(
        field,
        format!("expected a non-negative integer, got {number}"),
    ))
}

fn timestamp_field(obj: &Map<String, Value>, field: &str) -> Result<DateTime<Utc>, SchemaError> {
    let raw = required_string(obj, field)?;
    parse_timestamp(&raw).ok_or_else(|| {
        SchemaError::new(
            field,
            format!("invalid timestamp {raw:?}, expected basic_date_time_no_millis"),
        )
    })
}

fn plugins_field(obj: &Map<String, Value>) -> Result<Option<Vec<String>>, SchemaError> {
    let items = match obj.get("plugins") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(SchemaError::new(
                "plugins",
                format!("expected an array of strings, got {other}"),
            ))
        }
    };
    let mut plugins = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(s) => plugins.push(s.clone()),
            other => {
                return Err(SchemaError::new(
                    "plugins",
                    format!("expected an array of strings, found {other}"),
                ))
            }
        }
    }
    Ok(Some(plugins))
}

fn value_field(obj: &Map<String, Value>) -> Result<MetricValue, SchemaError> {
    let value = match obj.get("value") {
        None | Some(Value::Null) => {
            return Err(SchemaError::new("value", "required field is missing"))
        }
        Some(Value::Object(fields)) => fields,
        Some(other) => {
            return Err(SchemaError::new(
                "value",
                format!("expected an object, got {other}"),
            ))
        }
    };

    let mut metric = MetricValue::default();
    for (key, entry) in value {
        if SUMMARY_KEYS.contains(&key.as_str()) {
            let number = match entry {
                Value::Null => continue,
                Value::Number(n) => n.as_f64().ok_or_else(|| {
                    SchemaError::new(
                        format!("value.{key}"),
                        format!("{n} is not representable as a float"),
                    )
                })?,
                other => {
                    return Err(SchemaError::new(
                        format!("value.{key}"),
                        format!("expected a number, got {other}"),
                    ))
                }
            };
            match key.as_str() {
                "single" => metric.single = Some(number),
                "min" => metric.min = Some(number),
                "mean" => metric.mean = Some(number),
                "median" => metric.median = Some(number),
                _ => metric.max = Some(number),
            }
        } else {
            metric.detail.insert(key.clone(), entry.clone());
        }
    }

    if metric.is_empty() {
        return Err(SchemaError::new(
            "value",
            "at least one of single, min, mean, median, max must be set",
        ));
    }
    Ok(metric)
}

fn collect_labels(obj: &Map<String, Value>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for (key, entry) in obj {
        if is_declared(key) {
            continue;
        }
        match entry {
            Value::Null => {}
            Value::String(s) => {
                labels.insert(key.clone(), s.clone());
            }
            other => {
                labels.insert(key.clone(), other.to_string());
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn raw_doc() -> Value {
        json!({
            "test-execution-id": "8727e5a6",
            "test-execution-timestamp": "20260821T101500Z",
            "environment": "nightly",
            "workload": "geonames",
            "test_procedure": "append-no-conflicts",
            "distribution-version": "2.11.0",
            "distribution-major-version": 2,
            "node-count": 3,
            "task": "index-append",
            "operation": "bulk",
            "name": "throughput",
            "plugins": ["analysis-icu"],
            "value": {"min": 990.0, "mean": 1020.5, "median": 1019.0, "max": 1088.2}
        })
    }

    #[test]
    fn test_valid_document_passes() {
        let doc = SchemaValidator::new().validate(&raw_doc()).unwrap();
        assert_eq!(doc.test_execution_id, "8727e5a6");
        assert_eq!(doc.name, "throughput");
        assert_eq!(doc.node_count, Some(3));
        assert_eq!(doc.value.mean, Some(1020.5));
        assert!(doc.active);
        assert!(doc.labels.is_empty());
    }

    #[test]
    fn test_unknown_string_field_becomes_label() {
        let mut raw = raw_doc();
        raw["workload-revision"] = json!("ab12cd");
        let doc = SchemaValidator::new().validate(&raw).unwrap();
        assert_eq!(doc.labels.get("workload-revision").unwrap(), "ab12cd");
    }

    #[test]
    fn test_unknown_non_string_field_is_canonicalized() {
        let mut raw = raw_doc();
        raw["meta"] = json!({"cores": 8});
        raw["shard-count"] = json!(5);
        let doc = SchemaValidator::new().validate(&raw).unwrap();
        assert_eq!(doc.labels.get("meta").unwrap(), "{\"cores\":8}");
        assert_eq!(doc.labels.get("shard-count").unwrap(), "5");
    }

    #[test]
    fn test_unknown_null_field_is_dropped() {
        let mut raw = raw_doc();
        raw["comment"] = Value::Null;
        let doc = SchemaValidator::new().validate(&raw).unwrap();
        assert!(!doc.labels.contains_key("comment"));
    }

    #[test]
    fn test_missing_execution_id_names_field() {
        let mut raw = raw_doc();
        raw.as_object_mut().unwrap().remove("test-execution-id");
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "test-execution-id");
    }

    #[test]
    fn test_missing_name_names_field() {
        let mut raw = raw_doc();
        raw.as_object_mut().unwrap().remove("name");
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "name");
    }

    #[test]
    fn test_malformed_timestamp_rejected() {
        let mut raw = raw_doc();
        raw["test-execution-timestamp"] = json!("2026-08-21T10:15:00Z");
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "test-execution-timestamp");
        assert!(err.reason.contains("basic_date_time_no_millis"));
    }

    #[test]
    fn test_node_count_accepts_integral_float() {
        let mut raw = raw_doc();
        raw["node-count"] = json!(3.0);
        let doc = SchemaValidator::new().validate(&raw).unwrap();
        assert_eq!(doc.node_count, Some(3));
    }

    #[test]
    fn test_node_count_rejects_fractional() {
        let mut raw = raw_doc();
        raw["node-count"] = json!(3.5);
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "node-count");
    }

    #[test]
    fn test_node_count_rejects_negative() {
        let mut raw = raw_doc();
        raw["node-count"] = json!(-1);
        assert!(SchemaValidator::new().validate(&raw).is_err());
    }

    #[test]
    fn test_node_count_rejects_string() {
        let mut raw = raw_doc();
        raw["node-count"] = json!("three");
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "node-count");
    }

    #[test]
    fn test_active_rejects_non_boolean() {
        let mut raw = raw_doc();
        raw["active"] = json!("yes");
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "active");
    }

    #[test]
    fn test_active_defaults_to_true() {
        let doc = SchemaValidator::new().validate(&raw_doc()).unwrap();
        assert!(doc.active);
    }

    #[test]
    fn test_plugins_rejects_non_array() {
        let mut raw = raw_doc();
        raw["plugins"] = json!("analysis-icu");
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "plugins");
    }

    #[test]
    fn test_plugins_rejects_non_string_element() {
        let mut raw = raw_doc();
        raw["plugins"] = json!(["analysis-icu", 7]);
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "plugins");
    }

    #[test]
    fn test_value_missing_rejected() {
        let mut raw = raw_doc();
        raw.as_object_mut().unwrap().remove("value");
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "value");
    }

    #[test]
    fn test_value_without_summary_rejected() {
        let mut raw = raw_doc();
        raw["value"] = json!({});
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "value");

        raw["value"] = json!({"50_0": 12.5, "unit": "ms"});
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "value");
    }

    #[test]
    fn test_value_rejects_non_numeric_summary() {
        let mut raw = raw_doc();
        raw["value"] = json!({"single": "fast"});
        let err = SchemaValidator::new().validate(&raw).unwrap_err();
        assert_eq!(err.field, "value.single");
    }

    #[test]
    fn test_value_detail_preserved() {
        let mut raw = raw_doc();
        raw["value"] = json!({"mean": 10.0, "unit": "ops/s", "99_9": 25.1});
        let doc = SchemaValidator::new().validate(&raw).unwrap();
        assert_eq!(doc.value.detail.get("unit").unwrap(), "ops/s");
        assert_eq!(doc.value.detail.get("99_9").unwrap(), 25.1);
    }

    #[test]
    fn test_non_object_document_rejected() {
        let err = SchemaValidator::new().validate(&json!([1, 2])).unwrap_err();
        assert_eq!(err.field, "document");
    }

    #[test]
    fn test_validation_does_not_mutate_input() {
        let raw = raw_doc();
        let before = raw.clone();
        let _ = SchemaValidator::new().validate(&raw);
        assert_eq!(raw, before);
    }

    #[test]
    fn test_validated_document_roundtrips_through_wire_form() {
        let mut raw = raw_doc();
        raw["user-tag"] = json!("release-check");
        let doc = SchemaValidator::new().validate(&raw).unwrap();
        let revalidated = SchemaValidator::new().validate(&doc.to_json()).unwrap();
        assert_eq!(doc, revalidated);
    }

    proptest! {
        #[test]
        fn test_any_summary_combination_is_accepted(
            single in proptest::option::of(-1e9f64..1e9),
            mean in proptest::option::of(-1e9f64..1e9),
            max in proptest::option::of(-1e9f64..1e9),
        ) {
            let mut value = serde_json::Map::new();
            if let Some(v) = single { value.insert("single".into(), json!(v)); }
            if let Some(v) = mean { value.insert("mean".into(), json!(v)); }
            if let Some(v) = max { value.insert("max".into(), json!(v)); }

            let mut raw = raw_doc();
            raw["value"] = Value::Object(value);
            let result = SchemaValidator::new().validate(&raw);
            if single.is_some() || mean.is_some() || max.is_some() {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn test_unknown_string_labels_survive(
            key in "[a-z][a-z0-9-]{1,16}",
            label in "[a-zA-Z0-9 ._-]{0,32}",
        ) {
            prop_assume!(!is_declared(&key));
            let mut raw = raw_doc();
            raw[key.as_str()] = json!(label);
            let doc = SchemaValidator::new().validate(&raw).unwrap();
            prop_assert_eq!(doc.labels.get(&key).map(String::as_str), Some(label.as_str()));
        }
    }
}
